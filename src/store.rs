//! Persistence layer for video records and the tutorial lists that reference
//! them.
//!
//! Records live in SQLite. List-valued fields are stored as JSON text columns
//! so a row maps one-to-one onto the JSON document the API returns.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored video as exposed by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Root-relative path of the uploaded original.
    pub url: String,
    pub length_seconds: i64,
    #[serde(default)]
    pub preview_frames_url: Vec<String>,
    #[serde(default)]
    pub view_count: i64,
}

/// Everything needed to create a video. `id` and `view_count` are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub length_seconds: i64,
    pub preview_frames_url: Vec<String>,
}

/// Caller-editable subset of a video. `None` leaves the column untouched;
/// `description: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

impl VideoPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

/// Parent aggregate holding an ordered list of video ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorialRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub videos: Vec<String>,
}

/// SQLite-backed store. A single connection is shared behind a mutex; callers
/// in async code are expected to hop onto a blocking thread first.
#[derive(Debug)]
pub struct VideoStore {
    conn: Mutex<Connection>,
}

impl VideoStore {
    /// Opens (and if necessary creates) the database file and its schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening video DB {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for video DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting video DB synchronous mode")?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory video DB")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        ensure_tables(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_video(&self, video: NewVideo) -> Result<VideoRecord> {
        let record = VideoRecord {
            id: Uuid::new_v4().to_string(),
            name: video.name,
            description: video.description,
            url: video.url,
            length_seconds: video.length_seconds,
            preview_frames_url: video.preview_frames_url,
            view_count: 0,
        };
        let frames_json = serde_json::to_string(&record.preview_frames_url)
            .context("serializing preview frame urls")?;

        self.conn.lock().execute(
            r#"
            INSERT INTO videos (
                id, name, description, url, length_seconds,
                preview_frames_url_json, view_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.name,
                record.description,
                record.url,
                record.length_seconds,
                frames_json,
                record.view_count,
            ],
        )?;

        Ok(record)
    }

    /// Returns every video in insertion order.
    pub fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, description, url, length_seconds,
                   preview_frames_url_json, view_count
            FROM videos
            ORDER BY rowid ASC
            "#,
        )?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_video_record(row)?);
        }
        Ok(records)
    }

    /// Looks a video up by id. Malformed ids are errors, unknown ids are
    /// `Ok(None)`.
    pub fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        let id = parse_id("video", id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, description, url, length_seconds,
                   preview_frames_url_json, view_count
            FROM videos
            WHERE id = ?1
            "#,
        )?;

        let mut rows = stmt.query([&id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_video_record(row)?)),
            None => Ok(None),
        }
    }

    /// Applies `patch` to the matching row. Updating an id that does not exist
    /// succeeds without touching anything.
    pub fn update_video(&self, id: &str, patch: &VideoPatch) -> Result<()> {
        let id = parse_id("video", id)?;
        if patch.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::new();
        let mut values: Vec<Option<String>> = Vec::new();
        if let Some(name) = &patch.name {
            assignments.push("name = ?");
            values.push(Some(name.clone()));
        }
        if let Some(description) = &patch.description {
            assignments.push("description = ?");
            values.push(description.clone());
        }
        values.push(Some(id));

        let sql = format!("UPDATE videos SET {} WHERE id = ?", assignments.join(", "));
        self.conn
            .lock()
            .execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    /// Adds one view in a single statement and returns the new count, or
    /// `None` when no such video exists.
    pub fn increment_view_count(&self, id: &str) -> Result<Option<i64>> {
        let id = parse_id("video", id)?;
        let count = self
            .conn
            .lock()
            .query_row(
                "UPDATE videos SET view_count = view_count + 1 WHERE id = ?1 RETURNING view_count",
                [&id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    /// Removes the video if present. Deleting an unknown id is not an error.
    /// Tutorials that reference the video keep the dangling id.
    pub fn delete_video(&self, id: &str) -> Result<()> {
        let id = parse_id("video", id)?;
        self.conn
            .lock()
            .execute("DELETE FROM videos WHERE id = ?1", [&id])?;
        Ok(())
    }

    pub fn insert_tutorial(&self, name: &str) -> Result<TutorialRecord> {
        let record = TutorialRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            videos: Vec::new(),
        };
        self.conn.lock().execute(
            "INSERT INTO tutorials (id, name, videos_json) VALUES (?1, ?2, '[]')",
            params![record.id, record.name],
        )?;
        Ok(record)
    }

    pub fn get_tutorial(&self, id: &str) -> Result<Option<TutorialRecord>> {
        let id = parse_id("tutorial", id)?;
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT name, videos_json FROM tutorials WHERE id = ?1",
                [&id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((name, videos_json)) = row else {
            return Ok(None);
        };
        let videos: Vec<String> =
            serde_json::from_str(&videos_json).context("parsing stored tutorial videos JSON")?;
        Ok(Some(TutorialRecord { id, name, videos }))
    }

    /// Appends `video_id` to the tutorial's list. Returns `false` when the
    /// tutorial does not exist. The read-modify-write runs in one transaction.
    pub fn append_video_to_tutorial(&self, tutorial_id: &str, video_id: &str) -> Result<bool> {
        let tutorial_id = parse_id("tutorial", tutorial_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let videos_json: Option<String> = tx
            .query_row(
                "SELECT videos_json FROM tutorials WHERE id = ?1",
                [&tutorial_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(videos_json) = videos_json else {
            return Ok(false);
        };

        let mut videos: Vec<String> =
            serde_json::from_str(&videos_json).context("parsing stored tutorial videos JSON")?;
        videos.push(video_id.to_owned());
        let videos_json = serde_json::to_string(&videos).context("serializing tutorial videos")?;

        tx.execute(
            "UPDATE tutorials SET videos_json = ?1 WHERE id = ?2",
            params![videos_json, tutorial_id],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

/// Creates the tables if they do not already exist, inside one transaction.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            url TEXT NOT NULL,
            length_seconds INTEGER NOT NULL,
            preview_frames_url_json TEXT NOT NULL DEFAULT '[]',
            view_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tutorials (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            videos_json TEXT NOT NULL DEFAULT '[]'
        );
        "#,
    )?;

    tx.commit()?;
    Ok(())
}

/// Normalizes an id to the canonical hyphenated form used as primary key.
fn parse_id(kind: &str, id: &str) -> Result<String> {
    let parsed =
        Uuid::parse_str(id.trim()).with_context(|| format!("invalid {kind} id {id:?}"))?;
    Ok(parsed.to_string())
}

fn row_to_video_record(row: &Row<'_>) -> Result<VideoRecord> {
    let frames_json: String = row.get("preview_frames_url_json")?;
    let preview_frames_url: Vec<String> =
        serde_json::from_str(&frames_json).context("parsing stored preview frames JSON")?;

    Ok(VideoRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        url: row.get("url")?,
        length_seconds: row.get("length_seconds")?,
        preview_frames_url,
        view_count: row.get("view_count")?,
    })
}
