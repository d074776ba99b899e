use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::{Result, Store};
use crate::{PlaybackState, QueueItem, QueueItemStatus, SessionSettings, Singer, Song};

/// SQLite-backed [`Store`].
///
/// Every record is stored as JSON, one row per record. The queue and
/// history keep their order in a `position` column; singletons (current,
/// playback, settings) live in a keyed `slots` table. This keeps the layer
/// a plain record store with no knowledge of session rules.
pub struct SqliteStore {
    pool: SqlitePool,
}

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS singers (
        id TEXT PRIMARY KEY,
        record TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS songs (
        video_id TEXT PRIMARY KEY,
        record TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue (
        position INTEGER PRIMARY KEY,
        item_id TEXT NOT NULL,
        record TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS history (
        position INTEGER PRIMARY KEY,
        item_id TEXT NOT NULL,
        record TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS slots (
        key TEXT PRIMARY KEY,
        record TEXT NOT NULL
    )",
];

impl SqliteStore {
    /// Connects to the given database url and creates the schema if it
    /// doesn't exist yet.
    ///
    /// The pool is pinned to a single connection so a `sqlite::memory:`
    /// database is shared rather than opened fresh per connection.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    async fn slot<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let record: Option<String> = sqlx::query_scalar("SELECT record FROM slots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        record.map(decode).transpose()
    }

    async fn save_slot<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        sqlx::query(
            "INSERT INTO slots (key, record) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET record = excluded.record",
        )
        .bind(key)
        .bind(encode(value)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_singer(&self, singer: &Singer) -> Result<()> {
        sqlx::query(
            "INSERT INTO singers (id, record) VALUES (?, ?)
             ON CONFLICT (id) DO UPDATE SET record = excluded.record",
        )
        .bind(&singer.id)
        .bind(encode(singer)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn singer_by_id(&self, singer_id: &str) -> Result<Option<Singer>> {
        let record: Option<String> =
            sqlx::query_scalar("SELECT record FROM singers WHERE id = ?")
                .bind(singer_id)
                .fetch_optional(&self.pool)
                .await?;

        record.map(decode).transpose()
    }

    async fn all_singers(&self) -> Result<Vec<Singer>> {
        // rowid keeps join order stable, reclaims included
        let rows: Vec<String> = sqlx::query_scalar("SELECT record FROM singers ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn save_song(&self, song: &Song) -> Result<()> {
        sqlx::query(
            "INSERT INTO songs (video_id, record) VALUES (?, ?)
             ON CONFLICT (video_id) DO UPDATE SET record = excluded.record",
        )
        .bind(&song.video_id)
        .bind(encode(song)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn song_by_video_id(&self, video_id: &str) -> Result<Option<Song>> {
        let record: Option<String> =
            sqlx::query_scalar("SELECT record FROM songs WHERE video_id = ?")
                .bind(video_id)
                .fetch_optional(&self.pool)
                .await?;

        record.map(decode).transpose()
    }

    async fn queue(&self) -> Result<Vec<QueueItem>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT record FROM queue ORDER BY position")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn append_to_queue(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue (position, item_id, record)
             VALUES ((SELECT COALESCE(MAX(position), 0) + 1 FROM queue), ?, ?)",
        )
        .bind(&item.id)
        .bind(encode(item)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prepend_to_queue(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue (position, item_id, record)
             VALUES ((SELECT COALESCE(MIN(position), 0) - 1 FROM queue), ?, ?)",
        )
        .bind(&item.id)
        .bind(encode(item)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_from_queue(&self, item_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reorder_queue(&self, item_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT item_id, record FROM queue")
                .fetch_all(&mut *tx)
                .await?;
        let mut by_id: HashMap<String, String> = rows.into_iter().collect();

        sqlx::query("DELETE FROM queue").execute(&mut *tx).await?;

        for (position, item_id) in item_ids.iter().enumerate() {
            if let Some(record) = by_id.remove(item_id) {
                sqlx::query("INSERT INTO queue (position, item_id, record) VALUES (?, ?, ?)")
                    .bind(position as i64)
                    .bind(item_id)
                    .bind(record)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_item_status(&self, item_id: &str, status: QueueItemStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let record: Option<String> =
            sqlx::query_scalar("SELECT record FROM queue WHERE item_id = ?")
                .bind(item_id)
                .fetch_optional(&mut *tx)
                .await?;

        let record = match record {
            Some(record) => record,
            None => return Ok(()),
        };

        let mut item: QueueItem = decode(record)?;
        item.status = status;

        sqlx::query("UPDATE queue SET record = ? WHERE item_id = ?")
            .bind(encode(&item)?)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self) -> Result<Vec<QueueItem>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT record FROM history ORDER BY position")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn prepend_to_history(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO history (position, item_id, record)
             VALUES ((SELECT COALESCE(MIN(position), 0) - 1 FROM history), ?, ?)",
        )
        .bind(&item.id)
        .bind(encode(item)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pop_history(&self) -> Result<Option<QueueItem>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT position, record FROM history ORDER BY position LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        let (position, record) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        sqlx::query("DELETE FROM history WHERE position = ?")
            .bind(position)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        decode(record).map(Some)
    }

    async fn current(&self) -> Result<Option<QueueItem>> {
        self.slot("current").await
    }

    async fn save_current(&self, item: &QueueItem) -> Result<()> {
        self.save_slot("current", item).await
    }

    async fn clear_current(&self) -> Result<()> {
        sqlx::query("DELETE FROM slots WHERE key = 'current'")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn playback(&self) -> Result<PlaybackState> {
        Ok(self.slot("playback").await?.unwrap_or_default())
    }

    async fn save_playback(&self, playback: &PlaybackState) -> Result<()> {
        self.save_slot("playback", playback).await
    }

    async fn settings(&self) -> Result<SessionSettings> {
        Ok(self.slot("settings").await?.unwrap_or_default())
    }

    async fn save_settings(&self, settings: &SessionSettings) -> Result<()> {
        self.save_slot("settings", settings).await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(record: String) -> Result<T> {
    Ok(serde_json::from_str(&record)?)
}
