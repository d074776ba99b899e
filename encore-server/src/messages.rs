use encore_session::{
    PlaybackState, QueueItem, SessionSettings, SessionState, SettingUpdate, Singer, Song,
};
use serde::{Deserialize, Serialize};

/// Everything a client may say over the socket.
///
/// The `type` tag picks the variant, so an unknown type or a malformed
/// payload fails in one place, before any handler runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        /// Missing (not just empty) names fall back to "Anonymous".
        #[serde(default)]
        name: Option<String>,
        /// Presented to reclaim a previous identity after a reconnect.
        #[serde(default)]
        singer_id: Option<String>,
    },
    Search {
        #[serde(default)]
        query: String,
    },
    QueueSong {
        video_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        thumbnail_url: String,
        #[serde(default)]
        duration_seconds: u64,
    },
    RemoveFromQueue {
        item_id: String,
    },
    ReorderQueue {
        #[serde(default)]
        item_ids: Vec<String>,
    },
    /// `action` stays a free-form string so an unsupported action can be
    /// answered with an error naming it instead of a parse failure.
    Playback {
        #[serde(default)]
        action: String,
    },
    Seek {
        #[serde(default, alias = "position")]
        position_seconds: f64,
    },
    Pitch {
        #[serde(default)]
        value: i32,
    },
    PositionUpdate {
        #[serde(default, alias = "position")]
        position_seconds: f64,
    },
    UpdateSetting {
        #[serde(flatten)]
        update: SettingUpdate,
    },
    ShowQr,
    ScreenMessage {
        #[serde(default)]
        text: String,
    },
}

impl ClientMessage {
    /// Every wire name a client may use in the `type` tag.
    pub const KNOWN_TYPES: [&'static str; 12] = [
        "join",
        "search",
        "queue_song",
        "remove_from_queue",
        "reorder_queue",
        "playback",
        "seek",
        "pitch",
        "position_update",
        "update_setting",
        "show_qr",
        "screen_message",
    ];

    /// The wire name of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Search { .. } => "search",
            Self::QueueSong { .. } => "queue_song",
            Self::RemoveFromQueue { .. } => "remove_from_queue",
            Self::ReorderQueue { .. } => "reorder_queue",
            Self::Playback { .. } => "playback",
            Self::Seek { .. } => "seek",
            Self::Pitch { .. } => "pitch",
            Self::PositionUpdate { .. } => "position_update",
            Self::UpdateSetting { .. } => "update_setting",
            Self::ShowQr => "show_qr",
            Self::ScreenMessage { .. } => "screen_message",
        }
    }
}

/// Everything the server says back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot for a freshly joined client, including its own id so
    /// it can tell itself apart in the singer list.
    State {
        singer_id: String,
        #[serde(flatten)]
        state: SessionState,
    },
    SingerJoined {
        singer: Singer,
    },
    SearchResults {
        songs: Vec<Song>,
    },
    SongQueued {
        item: QueueItem,
    },
    QueueUpdated {
        queue: Vec<QueueItem>,
    },
    NowPlaying {
        item: Option<QueueItem>,
    },
    PlaybackUpdated {
        playback: PlaybackState,
    },
    DownloadProgress {
        item_id: String,
        video_id: String,
        progress: f64,
    },
    DownloadError {
        item_id: String,
        video_id: String,
    },
    SettingsUpdated {
        settings: SessionSettings,
    },
    ShowQr,
    ScreenMessage {
        name: String,
        text: String,
    },
    /// Elapsed-time relay from the display client to everyone else.
    PositionUpdate {
        position: f64,
    },
    Error {
        message: String,
    },
}
