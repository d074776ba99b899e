use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};

use super::{MediaError, MediaFetcher, ProgressFn, SearchProvider, SearchResult};

const YT_UNAVAILABLE: &str = "Video unavailable. This video is not available";
const YT_NOT_FOUND: &str = "Video unavailable";
const YT_ID_ERROR: &str = "Incomplete YouTube ID";

/// webm first so the files play in browsers without remuxing
const FORMAT: &str = "bestvideo[ext=webm]+bestaudio[ext=webm]/best[ext=webm]/best";

const PROGRESS_TEMPLATE: &str =
    "download:%(progress.downloaded_bytes)s/%(progress.total_bytes,progress.total_bytes_estimate)s";

const SEARCH_LIMIT: usize = 15;

/// Media backend backed by the `yt-dlp` executable.
///
/// Both fetching and searching shell out instead of linking a client
/// library, so keeping up with site changes is a matter of updating the
/// executable.
#[derive(Debug, Default, Clone)]
pub struct YtDlp;

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn fetch(
        &self,
        video_id: &str,
        dest_dir: &Path,
        on_progress: ProgressFn,
    ) -> Result<(), MediaError> {
        let url = format!("https://www.youtube.com/watch?v={video_id}");
        // The requested id becomes the file stem, which is what the cache
        // lookup goes by.
        let template = dest_dir.join(format!("{video_id}.%(ext)s"));

        let mut child = Command::new("yt-dlp")
            // One parseable progress line per update, nothing else on stdout.
            .arg("--newline")
            .arg("--no-warnings")
            .args(["--progress-template", PROGRESS_TEMPLATE])
            .args(["-f", FORMAT])
            .arg("-o")
            .arg(&template)
            .args(["--", &url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MediaError::Failed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Failed("no stdout handle".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::Failed("no stderr handle".to_string()))?;

        // Drain stderr concurrently so a chatty child can't block on a full
        // pipe while we stream stdout.
        let errors = tokio::spawn(async move {
            let mut output = String::new();
            stderr.read_to_string(&mut output).await.ok();
            output
        });

        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))?
        {
            if let Some(fraction) = parse_progress(&line) {
                on_progress(fraction);
            }
        }

        let error_output = errors.await.unwrap_or_default();

        let exit = child
            .wait()
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))?;

        if !exit.success() {
            return Err(classify_stderr(&error_output));
        }

        Ok(())
    }
}

#[async_trait]
impl SearchProvider for YtDlp {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, MediaError> {
        let target = format!("ytsearch{SEARCH_LIMIT}:{query}");

        let mut child = Command::new("yt-dlp")
            // Don't resolve stream urls for the result list.
            .arg("--flat-playlist")
            // Or download anything.
            .arg("--skip-download")
            // Single JSON document on stdout.
            .arg("-J")
            .args(["--", &target])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MediaError::Failed(e.to_string()))?;

        let mut output = String::new();
        let mut error_output = String::new();

        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| MediaError::Failed(e.to_string()))?;
        }

        if let Some(mut stderr) = child.stderr.take() {
            stderr.read_to_string(&mut error_output).await.ok();
        }

        let exit = child
            .wait()
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))?;

        if !exit.success() {
            return Err(classify_stderr(&error_output));
        }

        let page: SearchPage =
            serde_json::from_str(&output).map_err(|e| MediaError::ParseError(e.to_string()))?;

        Ok(page.entries.into_iter().filter_map(into_result).collect())
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    entries: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// Parses one `--progress-template` line into a completed fraction.
fn parse_progress(line: &str) -> Option<f64> {
    let (downloaded, total) = line.strip_prefix("download:")?.split_once('/')?;

    let downloaded: f64 = downloaded.trim().parse().ok()?;
    let total: f64 = total.trim().parse().ok()?;

    if total <= 0.0 {
        return None;
    }

    Some((downloaded / total).clamp(0.0, 1.0))
}

fn classify_stderr(output: &str) -> MediaError {
    if output.contains(YT_UNAVAILABLE) {
        return MediaError::Unavailable;
    }

    if output.contains(YT_NOT_FOUND) {
        return MediaError::NotFound;
    }

    if output.contains(YT_ID_ERROR) {
        return MediaError::Invalid("Invalid video id".to_string());
    }

    MediaError::Failed(output.to_string())
}

/// Entries without an id are placeholders for deleted or private videos.
fn into_result(entry: SearchEntry) -> Option<SearchResult> {
    let video_id = entry.id?;

    Some(SearchResult {
        video_id,
        title: entry.title.unwrap_or_default(),
        thumbnail_url: entry
            .thumbnails
            .into_iter()
            .next()
            .map(|thumbnail| thumbnail.url)
            .unwrap_or_default(),
        duration_seconds: entry.duration.unwrap_or(0.0) as u64,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_progress_parsing() {
        assert_eq!(parse_progress("download:512/1024"), Some(0.5));
        assert_eq!(parse_progress("download:512.0/1024.0"), Some(0.5));

        // overshoot from a low estimate clamps instead of reporting > 1
        assert_eq!(parse_progress("download:2048/1024"), Some(1.0));

        assert_eq!(parse_progress("download:100/NA"), None);
        assert_eq!(parse_progress("download:100/0"), None);
        assert_eq!(parse_progress("[download] 42% of ~3.2MiB"), None);
    }

    #[test]
    fn test_stderr_classification() {
        assert!(matches!(
            classify_stderr("ERROR: Video unavailable. This video is not available"),
            MediaError::Unavailable
        ));
        assert!(matches!(
            classify_stderr("ERROR: Video unavailable"),
            MediaError::NotFound
        ));
        assert!(matches!(
            classify_stderr("ERROR: Incomplete YouTube ID abc"),
            MediaError::Invalid(_)
        ));
        assert!(matches!(
            classify_stderr("something else entirely"),
            MediaError::Failed(_)
        ));
    }

    #[test]
    fn test_search_page_parsing() {
        let raw = r#"{
            "entries": [
                {
                    "id": "dQw4w9WgXcQ",
                    "title": "Song A",
                    "thumbnails": [
                        {"url": "https://i.ytimg.com/a.jpg"},
                        {"url": "https://i.ytimg.com/a_hq.jpg"}
                    ],
                    "duration": 213.0
                },
                {
                    "id": null,
                    "title": "[Deleted video]"
                },
                {
                    "id": "xvFZjo5PgG0",
                    "title": null,
                    "duration": null
                }
            ]
        }"#;

        let page: SearchPage = serde_json::from_str(raw).unwrap();
        let results: Vec<_> = page.entries.into_iter().filter_map(into_result).collect();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].video_id, "dQw4w9WgXcQ");
        assert_eq!(results[0].thumbnail_url, "https://i.ytimg.com/a.jpg");
        assert_eq!(results[0].duration_seconds, 213);
        assert_eq!(results[1].title, "");
        assert_eq!(results[1].duration_seconds, 0);
    }
}
