use async_trait::async_trait;
use thiserror::Error;

mod sqlite;
pub use sqlite::*;

use crate::{PlaybackState, QueueItem, QueueItemStatus, SessionSettings, SessionState, Singer, Song};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Something went wrong talking to the underlying database
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A persisted record could not be decoded
    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The record layer every session entity lives in.
///
/// Deliberately dumb: plain keyed records and ordered lists, no business
/// logic. Missing records are `None` or the type's default, never an error,
/// so callers decide what absence means.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_singer(&self, singer: &Singer) -> Result<()>;
    async fn singer_by_id(&self, singer_id: &str) -> Result<Option<Singer>>;
    async fn all_singers(&self) -> Result<Vec<Singer>>;

    async fn save_song(&self, song: &Song) -> Result<()>;
    async fn song_by_video_id(&self, video_id: &str) -> Result<Option<Song>>;

    /// The live queue, front first.
    async fn queue(&self) -> Result<Vec<QueueItem>>;
    async fn append_to_queue(&self, item: &QueueItem) -> Result<()>;
    async fn prepend_to_queue(&self, item: &QueueItem) -> Result<()>;
    async fn remove_from_queue(&self, item_id: &str) -> Result<()>;
    /// Rewrites the queue to exactly the given ids, in the given order.
    /// Ids that don't resolve to a queued item are skipped, and items not
    /// listed are dropped.
    async fn reorder_queue(&self, item_ids: &[String]) -> Result<()>;
    async fn update_item_status(&self, item_id: &str, status: QueueItemStatus) -> Result<()>;

    /// Completed items, most recent first.
    async fn history(&self) -> Result<Vec<QueueItem>>;
    async fn prepend_to_history(&self, item: &QueueItem) -> Result<()>;
    async fn pop_history(&self) -> Result<Option<QueueItem>>;

    async fn current(&self) -> Result<Option<QueueItem>>;
    async fn save_current(&self, item: &QueueItem) -> Result<()>;
    async fn clear_current(&self) -> Result<()>;

    async fn playback(&self) -> Result<PlaybackState>;
    async fn save_playback(&self, playback: &PlaybackState) -> Result<()>;

    async fn settings(&self) -> Result<SessionSettings>;
    async fn save_settings(&self, settings: &SessionSettings) -> Result<()>;

    async fn full_state(&self) -> Result<SessionState> {
        Ok(SessionState {
            singers: self.all_singers().await?,
            queue: self.queue().await?,
            current: self.current().await?,
            playback: self.playback().await?,
            settings: self.settings().await?,
            history: self.history().await?,
        })
    }
}
