use std::{env, path::PathBuf, str::FromStr};

use encore_session::MediaConfig;

use crate::EncoreError;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 8000;

const DEFAULT_VIDEO_DIR: &str = "./data/videos";
const DEFAULT_DATABASE_URL: &str = "sqlite://data/encore.db?mode=rwc";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub video_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, EncoreError> {
        Ok(Self {
            port: parsed_var("ENCORE_SERVER_PORT", DEFAULT_PORT)?,
            video_dir: env::var("ENCORE_VIDEO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_VIDEO_DIR)),
            max_concurrent_downloads: parsed_var(
                "ENCORE_MAX_CONCURRENT_DOWNLOADS",
                DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            )?,
            database_url: env::var("ENCORE_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
        })
    }

    /// The slice of the config the media pipeline cares about.
    pub fn media(&self) -> MediaConfig {
        MediaConfig {
            video_dir: self.video_dir.clone(),
            max_concurrent: self.max_concurrent_downloads,
        }
    }
}

fn parsed_var<T>(name: &'static str, default: T) -> Result<T, EncoreError>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EncoreError::Config(format!("{} must be a number, got {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_config_mirrors_the_relevant_fields() {
        let config = Config {
            port: 1,
            video_dir: PathBuf::from("/tmp/videos"),
            max_concurrent_downloads: 3,
            database_url: "sqlite::memory:".to_string(),
        };

        let media = config.media();

        assert_eq!(media.video_dir, PathBuf::from("/tmp/videos"));
        assert_eq!(media.max_concurrent, 3);
    }
}
