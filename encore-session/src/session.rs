use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::{
    store::{Store, StoreError},
    PlaybackStatus, QueueItem, QueueItemStatus, SettingUpdate, Singer, Song,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Singer {0} not found")]
    SingerNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies the session rules on top of a [`Store`].
///
/// Holds no state of its own. Every operation reads the records it needs,
/// applies one transition and writes back, so concurrent operations settle
/// last-writer-wins rather than corrupting each other.
pub struct Session<S> {
    store: Arc<S>,
}

impl<S> Session<S>
where
    S: Store,
{
    pub fn new(store: &Arc<S>) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Admits a singer, reusing their prior identity when `presented_id`
    /// resolves. Returns the singer and whether they are new to the session.
    ///
    /// The first singer to ever join becomes host, and host identity never
    /// moves after that.
    pub async fn join(
        &self,
        name: &str,
        presented_id: Option<&str>,
    ) -> Result<(Singer, bool), StoreError> {
        if let Some(id) = presented_id {
            if let Some(mut singer) = self.store.singer_by_id(id).await? {
                singer.connected = true;
                singer.name = name.to_string();
                self.store.save_singer(&singer).await?;

                return Ok((singer, false));
            }
        }

        let singer = Singer::new(name);
        self.store.save_singer(&singer).await?;

        let mut settings = self.store.settings().await?;
        if settings.host_id.is_none() {
            settings.host_id = Some(singer.id.clone());
            self.store.save_settings(&settings).await?;

            info!("{} is now the session host", singer.name);
        }

        Ok((singer, true))
    }

    /// Marks a singer as disconnected. Their record and queued songs stay,
    /// so they can reclaim their spot later.
    pub async fn disconnect(&self, singer_id: &str) -> Result<(), StoreError> {
        if let Some(mut singer) = self.store.singer_by_id(singer_id).await? {
            singer.connected = false;
            self.store.save_singer(&singer).await?;
        }

        Ok(())
    }

    /// Appends a song to the queue tail on behalf of a singer.
    pub async fn queue_song(&self, singer_id: &str, song: Song) -> Result<QueueItem, SessionError> {
        let singer = self
            .store
            .singer_by_id(singer_id)
            .await?
            .ok_or_else(|| SessionError::SingerNotFound(singer_id.to_string()))?;

        let item = QueueItem::new(song, singer);
        self.store.append_to_queue(&item).await?;

        Ok(item)
    }

    /// Removes a queued item. The host can remove anything, everyone else
    /// only their own. Returns whether anything was removed.
    pub async fn remove_from_queue(
        &self,
        item_id: &str,
        requester_id: &str,
    ) -> Result<bool, StoreError> {
        let queue = self.store.queue().await?;
        let item = match queue.iter().find(|item| item.id == item_id) {
            Some(item) => item,
            None => return Ok(false),
        };

        if !self.is_host(requester_id).await? && item.singer.id != requester_id {
            return Ok(false);
        }

        self.store.remove_from_queue(item_id).await?;
        Ok(true)
    }

    /// Rewrites the queue to exactly the given ids, in the given order.
    /// Allowed for the host, or for anyone when the session says so.
    pub async fn reorder_queue(
        &self,
        item_ids: &[String],
        requester_id: &str,
    ) -> Result<bool, StoreError> {
        let settings = self.store.settings().await?;
        let is_host = settings.host_id.as_deref() == Some(requester_id);

        if !is_host && !settings.anyone_can_reorder {
            return Ok(false);
        }

        self.store.reorder_queue(item_ids).await?;
        Ok(true)
    }

    /// Moves playback one song forward.
    ///
    /// The finished current item goes to the front of the history, then the
    /// queue head becomes the new current. An empty queue clears the current
    /// item, so nothing plays until something is queued again.
    pub async fn advance_queue(&self) -> Result<Option<QueueItem>, StoreError> {
        if let Some(mut current) = self.store.current().await? {
            current.status = QueueItemStatus::Done;
            self.store.prepend_to_history(&current).await?;
        }

        let queue = self.store.queue().await?;
        let mut next = match queue.into_iter().next() {
            Some(item) => item,
            None => {
                self.store.clear_current().await?;
                return Ok(None);
            }
        };

        self.store.remove_from_queue(&next.id).await?;

        next.status = QueueItemStatus::Playing;
        self.store.save_current(&next).await?;
        self.reset_playback().await?;

        Ok(Some(next))
    }

    /// Moves playback one song back, undoing the most recent advance.
    ///
    /// The current item returns to the queue *head* so it keeps its place
    /// ahead of later additions. With no history this is a no-op.
    pub async fn go_previous(&self) -> Result<Option<QueueItem>, StoreError> {
        let mut previous = match self.store.pop_history().await? {
            Some(item) => item,
            None => return Ok(None),
        };

        if let Some(mut current) = self.store.current().await? {
            current.status = QueueItemStatus::Ready;
            self.store.prepend_to_queue(&current).await?;
        }

        previous.status = QueueItemStatus::Playing;
        self.store.save_current(&previous).await?;
        self.reset_playback().await?;

        Ok(Some(previous))
    }

    /// Whether a singer may drive playback: the host always can, and so can
    /// whoever's song is currently on.
    pub async fn can_control_playback(&self, requester_id: &str) -> Result<bool, StoreError> {
        if self.is_host(requester_id).await? {
            return Ok(true);
        }

        let current = self.store.current().await?;
        Ok(current
            .map(|item| item.singer.id == requester_id)
            .unwrap_or(false))
    }

    /// Applies a settings change. Host only; everyone else gets `false`.
    pub async fn update_setting(
        &self,
        requester_id: &str,
        update: SettingUpdate,
    ) -> Result<bool, StoreError> {
        if !self.is_host(requester_id).await? {
            return Ok(false);
        }

        let mut settings = self.store.settings().await?;

        match update {
            SettingUpdate::AnyoneCanReorder(value) => settings.anyone_can_reorder = value,
        }

        self.store.save_settings(&settings).await?;
        Ok(true)
    }

    async fn is_host(&self, singer_id: &str) -> Result<bool, StoreError> {
        let settings = self.store.settings().await?;
        Ok(settings.host_id.as_deref() == Some(singer_id))
    }

    /// Starts the new current song from the top. Pitch carries across songs
    /// so a singer's preferred key survives queue navigation.
    async fn reset_playback(&self) -> Result<(), StoreError> {
        let mut playback = self.store.playback().await?;

        playback.status = PlaybackStatus::Playing;
        playback.position_seconds = 0.0;

        self.store.save_playback(&playback).await?;
        Ok(())
    }
}
