use serde::{Deserialize, Serialize};

use crate::util::random_string;

/// The length of the opaque tokens issued for singers and queue items.
const TOKEN_LENGTH: usize = 12;

/// A participant in the session.
///
/// Identity is durable across reconnects: a client that presents its
/// previously issued id on join reclaims this record instead of creating a
/// new one. Singers are never deleted, only marked disconnected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Singer {
    pub id: String,
    pub name: String,
    pub connected: bool,
}

impl Singer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: random_string(TOKEN_LENGTH),
            name: name.into(),
            connected: true,
        }
    }
}

/// A cache registry entry for one piece of media, keyed by its external id.
///
/// `cached` is eventually consistent with the on-disk state kept by the
/// downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub cached: bool,
}

/// One song request bound to the singer who queued it.
///
/// The singer is a snapshot taken at enqueue time, so later renames don't
/// change attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub song: Song,
    pub singer: Singer,
    #[serde(default)]
    pub status: QueueItemStatus,
}

impl QueueItem {
    pub fn new(song: Song, singer: Singer) -> Self {
        Self {
            id: random_string(TOKEN_LENGTH),
            song,
            singer,
            status: QueueItemStatus::Waiting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    #[default]
    Waiting,
    Downloading,
    Ready,
    Playing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// The playback state of the shared display. Exactly one per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub position_seconds: f64,
    pub pitch_shift: i32,
}

impl PlaybackState {
    pub const PITCH_MIN: i32 = -6;
    pub const PITCH_MAX: i32 = 6;
}

/// Session-wide settings. `host_id` is set once, to the first singer who
/// ever joins, and never changes afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub host_id: Option<String>,
    pub anyone_can_reorder: bool,
}

/// A typed change to one mutable session setting.
///
/// `host_id` is deliberately not listed here, since the host is never
/// transferred. Unknown keys fail deserialization instead of being applied
/// blindly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum SettingUpdate {
    AnyoneCanReorder(bool),
}

/// Read-only composite of everything a client needs to render the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub singers: Vec<Singer>,
    pub queue: Vec<QueueItem>,
    pub current: Option<QueueItem>,
    pub playback: PlaybackState,
    pub settings: SessionSettings,
    pub history: Vec<QueueItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song() -> Song {
        Song {
            video_id: "abc123".to_string(),
            title: "Test Song".to_string(),
            thumbnail_url: "http://example.com/thumb.jpg".to_string(),
            duration_seconds: 180,
            cached: false,
        }
    }

    #[test]
    fn new_singers_are_connected_with_unique_ids() {
        let a = Singer::new("Alice");
        let b = Singer::new("Bob");

        assert!(a.connected);
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_queue_items_start_waiting() {
        let item = QueueItem::new(song(), Singer::new("Alice"));

        assert_eq!(item.status, QueueItemStatus::Waiting);
        assert!(!item.id.is_empty());
    }

    #[test]
    fn playback_defaults_to_stopped_at_zero() {
        let playback = PlaybackState::default();

        assert_eq!(playback.status, PlaybackStatus::Stopped);
        assert_eq!(playback.position_seconds, 0.0);
        assert_eq!(playback.pitch_shift, 0);
    }

    #[test]
    fn settings_default_without_host() {
        let settings = SessionSettings::default();

        assert!(settings.host_id.is_none());
        assert!(!settings.anyone_can_reorder);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let waiting = serde_json::to_value(QueueItemStatus::Waiting).unwrap();
        let playing = serde_json::to_value(PlaybackStatus::Playing).unwrap();

        assert_eq!(waiting, "waiting");
        assert_eq!(playing, "playing");
    }

    #[test]
    fn song_cached_defaults_to_false() {
        let parsed: Song = serde_json::from_str(
            r#"{"video_id":"abc","title":"t","thumbnail_url":"u","duration_seconds":10}"#,
        )
        .unwrap();

        assert!(!parsed.cached);
    }

    #[test]
    fn setting_update_uses_key_value_envelope() {
        let update = SettingUpdate::AnyoneCanReorder(true);
        let value = serde_json::to_value(&update).unwrap();

        assert_eq!(
            value,
            serde_json::json!({"key": "anyone_can_reorder", "value": true})
        );
    }

    #[test]
    fn unknown_setting_keys_are_rejected() {
        let result: Result<SettingUpdate, _> =
            serde_json::from_str(r#"{"key":"host_id","value":"someone"}"#);

        assert!(result.is_err());
    }
}
