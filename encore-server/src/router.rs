use std::sync::Arc;

use encore_session::{
    Downloader, MediaError, PlaybackState, PlaybackStatus, QueueItemStatus, SearchProvider,
    Session, SessionError, SettingUpdate, Song, Store, StoreError,
};
use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    events::{DownloadEvent, EventSender},
    messages::{ClientMessage, ServerMessage},
    ws::{ConnectionId, ConnectionManager},
};

#[derive(Debug, Error)]
enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Turns inbound client messages into session mutations and outbound
/// traffic.
///
/// This is the universal catch boundary: a failing handler is logged and
/// answered with a unicast error naming the message type, and the
/// connection always survives.
pub struct MessageRouter<S> {
    session: Session<S>,
    store: Arc<S>,
    connections: Arc<ConnectionManager>,
    downloader: Arc<Downloader>,
    search: Arc<dyn SearchProvider>,
    events: EventSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> MessageRouter<S>
where
    S: Store,
{
    pub fn new(
        store: &Arc<S>,
        connections: &Arc<ConnectionManager>,
        downloader: &Arc<Downloader>,
        search: Arc<dyn SearchProvider>,
        events: EventSender,
    ) -> Self {
        Self {
            session: Session::new(store),
            store: store.clone(),
            connections: connections.clone(),
            downloader: downloader.clone(),
            search,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Entry point for one raw frame from a connection.
    pub async fn handle_text(&self, connection: ConnectionId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(connection, message).await,
            Err(err) => {
                warn!("Rejected message from {}: {}", connection, err);
                self.send_error(connection, describe_rejection(text));
            }
        }
    }

    async fn handle(&self, connection: ConnectionId, message: ClientMessage) {
        let tag = message.tag();

        if let Err(err) = self.dispatch(connection, message).await {
            error!("Error handling {}: {}", tag, err);
            self.send_error(connection, format!("Error handling {}", tag));
        }
    }

    async fn dispatch(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), RouterError> {
        match message {
            ClientMessage::Join { name, singer_id } => {
                self.handle_join(connection, name, singer_id).await
            }
            ClientMessage::Search { query } => self.handle_search(connection, query).await,
            ClientMessage::QueueSong {
                video_id,
                title,
                thumbnail_url,
                duration_seconds,
            } => {
                self.handle_queue_song(connection, video_id, title, thumbnail_url, duration_seconds)
                    .await
            }
            ClientMessage::RemoveFromQueue { item_id } => {
                self.handle_remove_from_queue(connection, item_id).await
            }
            ClientMessage::ReorderQueue { item_ids } => {
                self.handle_reorder_queue(connection, item_ids).await
            }
            ClientMessage::Playback { action } => self.handle_playback(connection, action).await,
            ClientMessage::Seek { position_seconds } => {
                self.handle_seek(position_seconds).await
            }
            ClientMessage::Pitch { value } => self.handle_pitch(value).await,
            ClientMessage::PositionUpdate { position_seconds } => {
                self.handle_position_update(connection, position_seconds).await
            }
            ClientMessage::UpdateSetting { update } => {
                self.handle_update_setting(connection, update).await
            }
            ClientMessage::ShowQr => {
                self.connections.broadcast(&ServerMessage::ShowQr);
                Ok(())
            }
            ClientMessage::ScreenMessage { text } => {
                self.handle_screen_message(connection, text).await
            }
        }
    }

    async fn handle_join(
        &self,
        connection: ConnectionId,
        name: Option<String>,
        presented_id: Option<String>,
    ) -> Result<(), RouterError> {
        let name = name.unwrap_or_else(|| "Anonymous".to_string());
        let (singer, is_new) = self.session.join(&name, presented_id.as_deref()).await?;

        self.connections.associate(connection, &singer.id);

        if is_new {
            info!("{} joined the session", singer.name);
        } else {
            info!("{} reconnected", singer.name);
        }

        let state = self.store.full_state().await?;
        self.connections.send_to(
            connection,
            &ServerMessage::State {
                singer_id: singer.id.clone(),
                state,
            },
        );

        self.connections
            .broadcast_except(&ServerMessage::SingerJoined { singer }, Some(connection));

        Ok(())
    }

    async fn handle_search(
        &self,
        connection: ConnectionId,
        query: String,
    ) -> Result<(), RouterError> {
        if query.is_empty() {
            self.send_error(connection, "Search query is required".to_string());
            return Ok(());
        }

        let results = self.search.search(&query).await?;

        let mut songs = Vec::with_capacity(results.len());
        for result in results {
            let cached = self.downloader.is_cached(&result.video_id);
            let song = Song {
                video_id: result.video_id,
                title: result.title,
                thumbnail_url: result.thumbnail_url,
                duration_seconds: result.duration_seconds,
                cached,
            };

            self.store.save_song(&song).await?;
            songs.push(song);
        }

        self.connections
            .send_to(connection, &ServerMessage::SearchResults { songs });

        Ok(())
    }

    async fn handle_queue_song(
        &self,
        connection: ConnectionId,
        video_id: String,
        title: String,
        thumbnail_url: String,
        duration_seconds: u64,
    ) -> Result<(), RouterError> {
        let singer_id = match self.require_joined(connection) {
            Some(id) => id,
            None => return Ok(()),
        };

        let cached = self.downloader.is_cached(&video_id);

        // The registry entry from an earlier search wins over the metadata
        // the client sent along.
        let song = match self.store.song_by_video_id(&video_id).await? {
            Some(song) => song,
            None => Song {
                video_id: video_id.clone(),
                title,
                thumbnail_url,
                duration_seconds,
                cached,
            },
        };

        let item = self.session.queue_song(&singer_id, song).await?;

        if cached {
            self.store
                .update_item_status(&item.id, QueueItemStatus::Ready)
                .await?;
        }

        self.broadcast_queue().await?;
        self.connections
            .broadcast(&ServerMessage::SongQueued { item: item.clone() });

        if cached {
            self.auto_advance().await?;
        } else {
            self.spawn_download(item.id, video_id);
        }

        Ok(())
    }

    async fn handle_remove_from_queue(
        &self,
        connection: ConnectionId,
        item_id: String,
    ) -> Result<(), RouterError> {
        let singer_id = match self.require_joined(connection) {
            Some(id) => id,
            None => return Ok(()),
        };

        if self.session.remove_from_queue(&item_id, &singer_id).await? {
            self.broadcast_queue().await?;
        } else {
            self.send_error(connection, "Cannot remove that item".to_string());
        }

        Ok(())
    }

    async fn handle_reorder_queue(
        &self,
        connection: ConnectionId,
        item_ids: Vec<String>,
    ) -> Result<(), RouterError> {
        let singer_id = match self.require_joined(connection) {
            Some(id) => id,
            None => return Ok(()),
        };

        if self.session.reorder_queue(&item_ids, &singer_id).await? {
            self.broadcast_queue().await?;
        } else {
            self.send_error(connection, "Cannot reorder queue".to_string());
        }

        Ok(())
    }

    async fn handle_playback(
        &self,
        connection: ConnectionId,
        action: String,
    ) -> Result<(), RouterError> {
        let mut playback = self.store.playback().await?;

        match action.as_str() {
            "play" => playback.status = PlaybackStatus::Playing,
            "pause" => playback.status = PlaybackStatus::Paused,
            "stop" => playback.status = PlaybackStatus::Stopped,
            "restart" => {
                playback.status = PlaybackStatus::Playing;
                playback.position_seconds = 0.0;
            }
            "skip" => {
                let current = self.session.advance_queue().await?;
                let queue = self.store.queue().await?;
                let playback = self.store.playback().await?;

                self.connections
                    .broadcast(&ServerMessage::NowPlaying { item: current });
                self.connections
                    .broadcast(&ServerMessage::QueueUpdated { queue });
                self.connections
                    .broadcast(&ServerMessage::PlaybackUpdated { playback });

                return Ok(());
            }
            other => {
                self.send_error(connection, format!("Unknown playback action: {}", other));
                return Ok(());
            }
        }

        self.store.save_playback(&playback).await?;
        self.connections
            .broadcast(&ServerMessage::PlaybackUpdated { playback });

        Ok(())
    }

    async fn handle_seek(&self, position_seconds: f64) -> Result<(), RouterError> {
        let mut playback = self.store.playback().await?;
        playback.position_seconds = position_seconds;
        self.store.save_playback(&playback).await?;

        self.connections
            .broadcast(&ServerMessage::PlaybackUpdated { playback });

        Ok(())
    }

    async fn handle_pitch(&self, value: i32) -> Result<(), RouterError> {
        let value = value.clamp(PlaybackState::PITCH_MIN, PlaybackState::PITCH_MAX);

        let mut playback = self.store.playback().await?;
        playback.pitch_shift = value;
        self.store.save_playback(&playback).await?;

        self.connections
            .broadcast(&ServerMessage::PlaybackUpdated { playback });

        Ok(())
    }

    /// Position reports from the display are persisted, so pausing from any
    /// client resumes at the real position, then relayed to everyone else.
    async fn handle_position_update(
        &self,
        connection: ConnectionId,
        position_seconds: f64,
    ) -> Result<(), RouterError> {
        let mut playback = self.store.playback().await?;
        playback.position_seconds = position_seconds;
        self.store.save_playback(&playback).await?;

        self.connections.broadcast_except(
            &ServerMessage::PositionUpdate {
                position: position_seconds,
            },
            Some(connection),
        );

        Ok(())
    }

    async fn handle_update_setting(
        &self,
        connection: ConnectionId,
        update: SettingUpdate,
    ) -> Result<(), RouterError> {
        let singer_id = match self.require_joined(connection) {
            Some(id) => id,
            None => return Ok(()),
        };

        if !self.session.update_setting(&singer_id, update).await? {
            self.send_error(connection, "Only the host can change settings".to_string());
            return Ok(());
        }

        let settings = self.store.settings().await?;
        self.connections
            .broadcast(&ServerMessage::SettingsUpdated { settings });

        Ok(())
    }

    async fn handle_screen_message(
        &self,
        connection: ConnectionId,
        text: String,
    ) -> Result<(), RouterError> {
        let mut name = "Anonymous".to_string();

        if let Some(singer_id) = self.connections.singer_id(connection) {
            if let Some(singer) = self.store.singer_by_id(&singer_id).await? {
                name = singer.name;
            }
        }

        self.connections
            .broadcast(&ServerMessage::ScreenMessage { name, text });

        Ok(())
    }

    /// Applies one transfer lifecycle event. Called from the event loop,
    /// never from the transfer tasks themselves.
    pub async fn handle_download_event(&self, event: DownloadEvent) {
        if let Err(err) = self.apply_download_event(event).await {
            error!("Error applying download event: {}", err);
        }
    }

    async fn apply_download_event(&self, event: DownloadEvent) -> Result<(), StoreError> {
        match event {
            DownloadEvent::Started { item_id, .. } => {
                self.store
                    .update_item_status(&item_id, QueueItemStatus::Downloading)
                    .await?;
                self.broadcast_queue().await?;
            }
            DownloadEvent::Progress {
                item_id,
                video_id,
                progress,
            } => {
                self.connections.broadcast(&ServerMessage::DownloadProgress {
                    item_id,
                    video_id,
                    progress,
                });
            }
            DownloadEvent::Finished { item_id, video_id } => {
                self.store
                    .update_item_status(&item_id, QueueItemStatus::Ready)
                    .await?;
                self.broadcast_queue().await?;

                if let Some(mut song) = self.store.song_by_video_id(&video_id).await? {
                    song.cached = true;
                    self.store.save_song(&song).await?;
                }

                self.auto_advance().await?;
            }
            DownloadEvent::Failed {
                item_id,
                video_id,
                error,
            } => {
                warn!("Failed to download video {}: {}", video_id, error);
                self.connections
                    .broadcast(&ServerMessage::DownloadError { item_id, video_id });
            }
        }

        Ok(())
    }

    /// Marks the singer behind a closed connection as disconnected. Their
    /// queued songs stay.
    pub async fn handle_disconnect(&self, singer_id: &str) {
        if let Err(err) = self.session.disconnect(singer_id).await {
            error!("Error marking singer {} disconnected: {}", singer_id, err);
        }
    }

    /// Aborts any transfer task still in flight.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// If nothing is currently playing, put the queue head on.
    async fn auto_advance(&self) -> Result<(), StoreError> {
        if self.store.current().await?.is_some() {
            return Ok(());
        }

        let item = self.session.advance_queue().await?;
        let queue = self.store.queue().await?;
        let playback = self.store.playback().await?;

        self.connections
            .broadcast(&ServerMessage::NowPlaying { item });
        self.connections
            .broadcast(&ServerMessage::QueueUpdated { queue });
        self.connections
            .broadcast(&ServerMessage::PlaybackUpdated { playback });

        Ok(())
    }

    fn spawn_download(&self, item_id: String, video_id: String) {
        let downloader = self.downloader.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let _ = events.send(DownloadEvent::Started {
                item_id: item_id.clone(),
                video_id: video_id.clone(),
            });

            let progress = {
                let events = events.clone();
                let item_id = item_id.clone();
                let video_id = video_id.clone();

                Box::new(move |progress: f64| {
                    let _ = events.send(DownloadEvent::Progress {
                        item_id: item_id.clone(),
                        video_id: video_id.clone(),
                        progress,
                    });
                })
            };

            let outcome = match downloader.acquire(&video_id, progress).await {
                Ok(_) => DownloadEvent::Finished { item_id, video_id },
                Err(err) => DownloadEvent::Failed {
                    item_id,
                    video_id,
                    error: err.to_string(),
                },
            };

            let _ = events.send(outcome);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn broadcast_queue(&self) -> Result<(), StoreError> {
        let queue = self.store.queue().await?;
        self.connections
            .broadcast(&ServerMessage::QueueUpdated { queue });

        Ok(())
    }

    /// The singer a connection joined as, answering "Not joined" when it
    /// hasn't.
    fn require_joined(&self, connection: ConnectionId) -> Option<String> {
        let singer_id = self.connections.singer_id(connection);

        if singer_id.is_none() {
            self.send_error(connection, "Not joined".to_string());
        }

        singer_id
    }

    fn send_error(&self, connection: ConnectionId, message: String) {
        self.connections
            .send_to(connection, &ServerMessage::Error { message });
    }
}

/// Picks the error text for a frame that did not deserialize: unknown tags
/// are named back to the sender, anything else is just invalid.
fn describe_rejection(text: &str) -> String {
    let tag = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(|tag| tag.as_str()).map(String::from));

    match tag {
        Some(tag) if !ClientMessage::KNOWN_TYPES.contains(&tag.as_str()) => {
            format!("Unknown message type: {}", tag)
        }
        _ => "Invalid message".to_string(),
    }
}
