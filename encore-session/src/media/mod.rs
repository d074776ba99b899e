use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use log::info;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};

mod youtube;
pub use youtube::*;

/// Progress callback handed to a fetch, called with a fraction in `[0, 1]`.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("Media was not found")]
    NotFound,
    #[error("Media is unavailable")]
    Unavailable,
    #[error("Invalid media id: {0}")]
    Invalid(String),
    #[error("Could not parse fetcher output: {0}")]
    ParseError(String),
    #[error("{0}")]
    Failed(String),
}

/// Network-facing side of acquisition. Implementations fetch one identifier
/// into the given directory, named so the file stem equals the identifier.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        video_id: &str,
        dest_dir: &Path,
        on_progress: ProgressFn,
    ) -> Result<(), MediaError>;
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, MediaError>;
}

/// One hit returned by a [`SearchProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: u64,
}

/// Where media lands on disk and how many transfers may run at once.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub video_dir: PathBuf,
    pub max_concurrent: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("videos"),
            max_concurrent: 2,
        }
    }
}

type Outcome = Result<PathBuf, MediaError>;

/// Brings media onto disk through a bounded number of concurrent transfers,
/// coalescing duplicate requests for the same identifier.
pub struct Downloader {
    video_dir: PathBuf,
    gate: Semaphore,
    in_flight: DashMap<String, broadcast::Sender<Outcome>>,
    fetcher: Arc<dyn MediaFetcher>,
}

impl Downloader {
    pub fn new(config: &MediaConfig, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self {
            video_dir: config.video_dir.clone(),
            gate: Semaphore::new(config.max_concurrent),
            in_flight: DashMap::new(),
            fetcher,
        }
    }

    /// Creates the cache directory if it doesn't exist yet.
    pub fn ensure_dir(&self) -> Result<(), MediaError> {
        fs::create_dir_all(&self.video_dir).map_err(|e| MediaError::Failed(e.to_string()))
    }

    /// The cached file for an identifier, whatever its extension.
    ///
    /// Only an exact file stem counts. Partial transfers land under names
    /// like `id.f616.webm` or `id.webm.part`, so those never match.
    pub fn video_path(&self, video_id: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.video_dir).ok()?;

        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .find(|path| {
                path.file_stem()
                    .map(|stem| stem == video_id)
                    .unwrap_or(false)
            })
    }

    pub fn is_cached(&self, video_id: &str) -> bool {
        self.video_path(video_id).is_some()
    }

    /// Ensures the media for an identifier is on disk and returns its path.
    ///
    /// Cache hits return right away without taking a transfer slot. A
    /// request for an identifier that is already being fetched waits for
    /// that transfer and shares its outcome instead of starting another;
    /// only the request driving the transfer sees progress callbacks.
    pub async fn acquire(&self, video_id: &str, on_progress: ProgressFn) -> Outcome {
        if let Some(path) = self.video_path(video_id) {
            return Ok(path);
        }

        let waiter = match self.in_flight.entry(video_id.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
                None
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(MediaError::Failed("transfer was abandoned".to_string())),
            };
        }

        let outcome = self.fetch_gated(video_id, on_progress).await;

        // Removing the entry before publishing means late arrivals hit the
        // cache path instead of subscribing to a finished channel.
        if let Some((_, tx)) = self.in_flight.remove(video_id) {
            let _ = tx.send(outcome.clone());
        }

        outcome
    }

    async fn fetch_gated(&self, video_id: &str, on_progress: ProgressFn) -> Outcome {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| MediaError::Failed("downloader is closed".to_string()))?;

        // Another request may have finished this while we waited for a slot
        if let Some(path) = self.video_path(video_id) {
            return Ok(path);
        }

        self.ensure_dir()?;

        info!("Fetching {video_id}...");
        self.fetcher
            .fetch(video_id, &self.video_dir, on_progress)
            .await?;
        info!("Fetched {video_id}");

        self.video_path(video_id)
            .ok_or_else(|| MediaError::Failed(format!("{video_id} missing after fetch")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::sleep;

    struct FakeFetcher {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        release: Semaphore,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                release: Semaphore::new(0),
                fail,
            })
        }

        /// Lets `count` in-flight fetches run to completion.
        fn finish(&self, count: usize) {
            self.release.add_permits(count);
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(
            &self,
            video_id: &str,
            dest_dir: &Path,
            on_progress: ProgressFn,
        ) -> Result<(), MediaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            on_progress(0.5);

            self.release
                .acquire()
                .await
                .map_err(|_| MediaError::Failed("closed".to_string()))?
                .forget();
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(MediaError::Failed("boom".to_string()));
            }

            fs::write(dest_dir.join(format!("{video_id}.webm")), b"video")
                .map_err(|e| MediaError::Failed(e.to_string()))?;
            Ok(())
        }
    }

    fn downloader(
        dir: &Path,
        max_concurrent: usize,
        fetcher: Arc<FakeFetcher>,
    ) -> Arc<Downloader> {
        let config = MediaConfig {
            video_dir: dir.to_path_buf(),
            max_concurrent,
        };

        Arc::new(Downloader::new(&config, fetcher))
    }

    fn no_progress() -> ProgressFn {
        Box::new(|_| {})
    }

    fn count_progress(hits: &Arc<AtomicUsize>) -> ProgressFn {
        let hits = hits.clone();
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn cache_hits_skip_the_fetcher_and_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.webm"), b"video").unwrap();

        let fetcher = FakeFetcher::new(false);
        // zero slots: anything that needed the gate would hang
        let downloader = downloader(dir.path(), 0, fetcher.clone());

        let path = downloader.acquire("abc", no_progress()).await.unwrap();
        assert_eq!(path, dir.path().join("abc.webm"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_files_do_not_count_as_cached() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.f616.webm"), b"half").unwrap();
        fs::write(dir.path().join("abc.webm.part"), b"half").unwrap();

        let fetcher = FakeFetcher::new(false);
        let downloader = downloader(dir.path(), 1, fetcher.clone());

        assert!(!downloader.is_cached("abc"));

        fetcher.finish(1);
        let path = downloader.acquire("abc", no_progress()).await.unwrap();
        assert_eq!(path, dir.path().join("abc.webm"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transfers_respect_the_concurrency_bound() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(false);
        let downloader = downloader(dir.path(), 2, fetcher.clone());

        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|id| {
                let downloader = downloader.clone();
                tokio::spawn(async move { downloader.acquire(id, no_progress()).await })
            })
            .collect();

        sleep(Duration::from_millis(20)).await;
        assert_eq!(fetcher.running.load(Ordering::SeqCst), 2);

        fetcher.finish(4);
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(false);
        let downloader = downloader(dir.path(), 2, fetcher.clone());

        let first = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("abc", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        let second = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("abc", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        fetcher.finish(1);
        let expected = dir.path().join("abc.webm");
        assert_eq!(first.await.unwrap().unwrap(), expected);
        assert_eq!(second.await.unwrap().unwrap(), expected);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failed_transfer_reaches_every_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(true);
        let downloader = downloader(dir.path(), 2, fetcher.clone());

        let first = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("abc", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        let second = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("abc", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        fetcher.finish(1);
        assert!(matches!(
            first.await.unwrap(),
            Err(MediaError::Failed(message)) if message == "boom"
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(MediaError::Failed(message)) if message == "boom"
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_only_reaches_the_driving_request() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(false);
        let downloader = downloader(dir.path(), 2, fetcher.clone());

        let driver_hits = Arc::new(AtomicUsize::new(0));
        let waiter_hits = Arc::new(AtomicUsize::new(0));

        let first = {
            let downloader = downloader.clone();
            let progress = count_progress(&driver_hits);
            tokio::spawn(async move { downloader.acquire("abc", progress).await })
        };
        sleep(Duration::from_millis(10)).await;

        let second = {
            let downloader = downloader.clone();
            let progress = count_progress(&waiter_hits);
            tokio::spawn(async move { downloader.acquire("abc", progress).await })
        };
        sleep(Duration::from_millis(10)).await;

        fetcher.finish(1);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(driver_hits.load(Ordering::SeqCst), 1);
        assert_eq!(waiter_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn the_cache_is_rechecked_after_waiting_for_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(false);
        let downloader = downloader(dir.path(), 1, fetcher.clone());

        // "a" holds the only slot
        let blocked = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("a", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        let queued = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire("b", no_progress()).await })
        };
        sleep(Duration::from_millis(10)).await;

        // "b" lands on disk while its request is still waiting in line
        fs::write(dir.path().join("b.webm"), b"video").unwrap();

        fetcher.finish(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(
            queued.await.unwrap().unwrap(),
            dir.path().join("b.webm")
        );

        // only "a" ever reached the fetcher
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
