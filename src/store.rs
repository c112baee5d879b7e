// src/store.rs

use crate::models::{Encoding, EncodingSet, Genre, Track, Video, VideoId};
use crate::retry::{FailureClass, Retryable};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::info;

/// Timestamp layout of `valid_from` / `valid_to`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store is closed")]
    Closed,
}

impl Retryable for StateError {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Storage
    }
}

/// What the segment-size pass needs from persistent storage.
#[async_trait]
pub trait EncodingStore: Send + Sync {
    /// Ids of every video without stored encodings, in processing order.
    async fn ids_lacking_encodings(&self) -> Result<Vec<VideoId>, StateError>;

    /// Stores one complete set of encodings atomically.
    async fn persist(&self, set: &EncodingSet) -> Result<(), StateError>;
}

/// SQLite-backed catalog and encoding store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

struct EncodingRow {
    bandwidth: i64,
    codecs: String,
    mime_type: String,
    first: i64,
    second: Option<i64>,
    segment_length: f64,
    segment_sizes: String,
}

impl EncodingRow {
    fn into_encoding(self, audio: bool) -> Result<Encoding, StateError> {
        let track = if audio {
            Track::Audio {
                sampling_rate: self.first as u32,
            }
        } else {
            Track::Video {
                width: self.first as u32,
                height: self.second.unwrap_or_default() as u32,
            }
        };
        Ok(Encoding {
            bandwidth: self.bandwidth as u64,
            codecs: self.codecs,
            mime_type: self.mime_type,
            segment_length: self.segment_length,
            segment_sizes: serde_json::from_str(&self.segment_sizes)?,
            track,
        })
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, StateError> {
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                    CREATE TABLE IF NOT EXISTS genres (
                        id              TEXT PRIMARY KEY,
                        name            TEXT NOT NULL,
                        description     TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS videos (
                        id                  TEXT PRIMARY KEY,
                        name                TEXT NOT NULL,
                        duration            INTEGER NOT NULL,
                        valid_from          TEXT NOT NULL,
                        valid_to            TEXT NOT NULL,
                        sweden_only         INTEGER NOT NULL,
                        url                 TEXT NOT NULL,
                        short_description   TEXT NOT NULL,
                        long_description    TEXT NOT NULL,
                        production_year     INTEGER
                    );
                    CREATE TABLE IF NOT EXISTS video_genres (
                        video   TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                        genre   TEXT NOT NULL REFERENCES genres(id) ON DELETE CASCADE,
                        PRIMARY KEY (video, genre)
                    );
                    CREATE TABLE IF NOT EXISTS video_encodings (
                        id              INTEGER PRIMARY KEY,
                        video           TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                        bandwidth       INTEGER NOT NULL,
                        codecs          TEXT NOT NULL,
                        mime_type       TEXT NOT NULL,
                        width           INTEGER NOT NULL,
                        height          INTEGER NOT NULL,
                        segment_length  REAL NOT NULL,
                        segment_sizes   TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS audio_encodings (
                        id              INTEGER PRIMARY KEY,
                        video           TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                        bandwidth       INTEGER NOT NULL,
                        codecs          TEXT NOT NULL,
                        mime_type       TEXT NOT NULL,
                        sampling_rate   INTEGER NOT NULL,
                        segment_length  REAL NOT NULL,
                        segment_sizes   TEXT NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts new genres and updates changed ones.
    pub async fn upsert_genres(&self, genres: &[Genre]) -> Result<usize, StateError> {
        let genres = genres.to_vec();
        let affected = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut affected = 0;
                for genre in &genres {
                    affected += tx.execute(
                        "INSERT INTO genres (id, name, description) VALUES (?1, ?2, ?3)
                        ON CONFLICT (id) DO UPDATE SET
                            name = excluded.name,
                            description = excluded.description
                        WHERE name <> excluded.name OR description <> excluded.description",
                        params![genre.id, genre.name, genre.description],
                    )?;
                }
                tx.commit()?;
                Ok(affected)
            })
            .await?;
        Ok(affected)
    }

    /// Inserts new videos, updates changed ones and syncs their genre links.
    /// Links to genres the store does not know are skipped.
    pub async fn upsert_videos(&self, videos: &[Video]) -> Result<usize, StateError> {
        let videos = videos.to_vec();
        let affected = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut affected = 0;
                for video in &videos {
                    affected += tx.execute(
                        "INSERT INTO videos (id, name, duration, valid_from, valid_to, sweden_only,
                            url, short_description, long_description, production_year)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                        ON CONFLICT (id) DO UPDATE SET
                            name = excluded.name,
                            duration = excluded.duration,
                            valid_from = excluded.valid_from,
                            valid_to = excluded.valid_to,
                            sweden_only = excluded.sweden_only,
                            url = excluded.url,
                            short_description = excluded.short_description,
                            long_description = excluded.long_description,
                            production_year = excluded.production_year
                        WHERE name <> excluded.name
                            OR duration <> excluded.duration
                            OR valid_from <> excluded.valid_from
                            OR valid_to <> excluded.valid_to
                            OR sweden_only <> excluded.sweden_only
                            OR url <> excluded.url
                            OR short_description <> excluded.short_description
                            OR long_description <> excluded.long_description
                            OR production_year IS NOT excluded.production_year",
                        params![
                            video.id,
                            video.name,
                            video.duration as i64,
                            video.valid_from,
                            video.valid_to,
                            video.sweden_only,
                            video.url,
                            video.short_description,
                            video.long_description,
                            video.production_year,
                        ],
                    )?;

                    tx.execute("DELETE FROM video_genres WHERE video = ?1", params![video.id])?;
                    for genre in &video.genres {
                        tx.execute(
                            "INSERT OR IGNORE INTO video_genres (video, genre)
                            SELECT ?1, id FROM genres WHERE id = ?2",
                            params![video.id, genre],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(affected)
            })
            .await?;
        info!(affected, "added/updated videos");
        Ok(affected)
    }

    /// Drops videos (and their encodings) outside their availability window.
    pub async fn delete_deprecated(&self, now: NaiveDateTime) -> Result<usize, StateError> {
        let now = now.format(TIMESTAMP_FORMAT).to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM videos WHERE valid_to < ?1 OR valid_from > ?1",
                    params![now],
                )?)
            })
            .await?;
        info!(deleted, "deleted deprecated videos");
        Ok(deleted)
    }

    /// Reads back the stored encodings of a video.
    pub async fn load_encoding_set(&self, video_id: &str) -> Result<Option<EncodingSet>, StateError> {
        let id = video_id.to_string();
        let (videos, audio) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT bandwidth, codecs, mime_type, width, height, segment_length, segment_sizes
                    FROM video_encodings WHERE video = ?1 ORDER BY id",
                )?;
                let videos = stmt
                    .query_map(params![id], |row| {
                        Ok(EncodingRow {
                            bandwidth: row.get(0)?,
                            codecs: row.get(1)?,
                            mime_type: row.get(2)?,
                            first: row.get(3)?,
                            second: row.get(4)?,
                            segment_length: row.get(5)?,
                            segment_sizes: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;

                let audio = conn
                    .query_row(
                        "SELECT bandwidth, codecs, mime_type, sampling_rate, segment_length, segment_sizes
                        FROM audio_encodings WHERE video = ?1 ORDER BY id LIMIT 1",
                        params![id],
                        |row| {
                            Ok(EncodingRow {
                                bandwidth: row.get(0)?,
                                codecs: row.get(1)?,
                                mime_type: row.get(2)?,
                                first: row.get(3)?,
                                second: None,
                                segment_length: row.get(4)?,
                                segment_sizes: row.get(5)?,
                            })
                        },
                    )
                    .optional()?;
                Ok((videos, audio))
            })
            .await?;

        let Some(audio) = audio else {
            return Ok(None);
        };
        Ok(Some(EncodingSet {
            video_id: video_id.to_string(),
            videos: videos
                .into_iter()
                .map(|row| row.into_encoding(false))
                .collect::<Result<_, _>>()?,
            audio: audio.into_encoding(true)?,
        }))
    }
}

#[async_trait]
impl EncodingStore for SqliteStore {
    async fn ids_lacking_encodings(&self) -> Result<Vec<VideoId>, StateError> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM videos
                    WHERE id NOT IN (SELECT DISTINCT video FROM video_encodings)
                    ORDER BY id",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn persist(&self, set: &EncodingSet) -> Result<(), StateError> {
        let mut videos = Vec::with_capacity(set.videos.len());
        for encoding in &set.videos {
            videos.push((encoding.clone(), serde_json::to_string(&encoding.segment_sizes)?));
        }
        let audio = (
            set.audio.clone(),
            serde_json::to_string(&set.audio.segment_sizes)?,
        );
        let video_id = set.video_id.clone();

        let (video_rows, audio_rows) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut video_rows = 0;
                for (encoding, sizes) in &videos {
                    let (width, height) = match encoding.track {
                        Track::Video { width, height } => (width, height),
                        Track::Audio { .. } => (0, 0),
                    };
                    video_rows += tx.execute(
                        "INSERT INTO video_encodings (video, bandwidth, codecs, mime_type, width,
                            height, segment_length, segment_sizes)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            video_id,
                            encoding.bandwidth as i64,
                            encoding.codecs,
                            encoding.mime_type,
                            width,
                            height,
                            encoding.segment_length,
                            sizes,
                        ],
                    )?;
                }

                let (encoding, sizes) = &audio;
                let sampling_rate = match encoding.track {
                    Track::Audio { sampling_rate } => sampling_rate,
                    Track::Video { .. } => 0,
                };
                let audio_rows = tx.execute(
                    "INSERT INTO audio_encodings (video, bandwidth, codecs, mime_type,
                        sampling_rate, segment_length, segment_sizes)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        video_id,
                        encoding.bandwidth as i64,
                        encoding.codecs,
                        encoding.mime_type,
                        sampling_rate,
                        encoding.segment_length,
                        sizes,
                    ],
                )?;
                tx.commit()?;
                Ok((video_rows, audio_rows))
            })
            .await?;

        info!(
            video_id = %set.video_id,
            video_encodings = video_rows,
            audio_encodings = audio_rows,
            segments = set.segment_count(),
            bytes = set.total_bytes(),
            "stored encodings"
        );
        Ok(())
    }
}
