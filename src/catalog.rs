#![forbid(unsafe_code)]

//! Catalog persistence for MediaVault.
//!
//! One SQLite database holds the downloaded media records and the playlists
//! that reference them. Playlist memberships are wired with cascading
//! foreign keys so deleting a record or a playlist can never leave dangling
//! references behind.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

/// Kind of stored media, as recorded per row and inferred during sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    /// Maps a file extension to the media kind handled by the catalog.
    /// Anything else (thumbnails, partial downloads, the database itself)
    /// is invisible to `sync_from_disk`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "mp4" => Some(Self::Video),
            "mp3" | "m4a" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Row stored in the `media` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    pub owner_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub title: String,
    pub media_type: MediaType,
    pub storage_path: String,
    pub created_at: String,
}

/// Fields needed to insert a new media row; `id` and `created_at` are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMedia {
    pub owner_id: String,
    pub filename: String,
    pub original_url: Option<String>,
    pub title: String,
    pub media_type: MediaType,
    pub storage_path: String,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, so it must go through the query API.
    conn.query("PRAGMA journal_mode=WAL;", ()).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS media (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            original_url TEXT,
            title TEXT NOT NULL,
            media_type TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_media_owner ON media(owner_id);
        CREATE INDEX IF NOT EXISTS idx_media_filename ON media(filename);

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(owner_id, name)
        );

        CREATE TABLE IF NOT EXISTS playlist_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            playlist_id INTEGER NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
            UNIQUE(playlist_id, media_id)
        );

        CREATE INDEX IF NOT EXISTS idx_playlist_items_media ON playlist_items(media_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite connection serving both reads and writes.
#[derive(Clone)]
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (and if necessary creates) the catalog DB and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        let mut rows = self.conn.query("SELECT 1", params![]).await?;
        rows.next().await?.context("missing ping row")?;
        Ok(())
    }

    /// Inserts a media row and returns its id.
    ///
    /// The storage path must point at an existing file; resolution (or the
    /// disk scan) guarantees this upstream and the store refuses to record a
    /// path it cannot see.
    pub async fn insert_media(&self, media: &NewMedia) -> Result<i64> {
        if !Path::new(&media.storage_path).exists() {
            bail!("storage path {} does not exist", media.storage_path);
        }

        let created_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                r#"
                INSERT INTO media (
                    owner_id, filename, original_url, title,
                    media_type, storage_path, created_at
                ) VALUES (
                    :owner_id, :filename, :original_url, :title,
                    :media_type, :storage_path, :created_at
                )
                "#,
                params![
                    media.owner_id.as_str(),
                    media.filename.as_str(),
                    media.original_url.as_deref(),
                    media.title.as_str(),
                    media.media_type.as_str(),
                    media.storage_path.as_str(),
                    created_at,
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Media records owned by `owner_id`, newest first.
    pub async fn list_media(&self, owner_id: &str) -> Result<Vec<MediaRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, owner_id, filename, original_url, title,
                       media_type, storage_path, created_at
                FROM media
                WHERE owner_id = ?1
                ORDER BY created_at DESC, id DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query([owner_id]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_media(&row)?);
        }
        Ok(records)
    }

    pub async fn find_media(&self, owner_id: &str, filename: &str) -> Result<Option<MediaRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, owner_id, filename, original_url, title,
                       media_type, storage_path, created_at
                FROM media
                WHERE owner_id = ?1 AND filename = ?2
                "#,
            )
            .await?;

        let mut rows = stmt.query([owner_id, filename]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_media(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Whether any owner already has a record for this on-disk filename.
    /// `sync_from_disk` keys on this, which is what makes a second scan of
    /// an unchanged directory insert nothing.
    pub async fn filename_in_catalog(&self, filename: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM media WHERE filename = ?1 LIMIT 1", [filename])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Deletes a media row; playlist memberships cascade away with it.
    pub async fn delete_media(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM media WHERE id = ?1", params![id])
            .await?;
        Ok(())
    }

    /// Scans the flat media directory and records every media file that is
    /// not in the catalog yet, assigning it to `owner_id`. Returns the
    /// number of records inserted.
    pub async fn sync_from_disk(&self, media_dir: &Path, owner_id: &str) -> Result<u64> {
        let entries = fs::read_dir(media_dir)
            .with_context(|| format!("scanning media directory {}", media_dir.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            names.push(name.to_string());
        }
        names.sort();

        let mut inserted = 0;
        for name in names {
            let Some(media_type) = Path::new(&name)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase())
                .and_then(|ext| MediaType::from_extension(&ext))
            else {
                continue;
            };
            if self.filename_in_catalog(&name).await? {
                continue;
            }
            let storage_path = media_dir.join(&name);
            self.insert_media(&NewMedia {
                owner_id: owner_id.to_string(),
                filename: name.clone(),
                original_url: None,
                title: name,
                media_type,
                storage_path: storage_path.to_string_lossy().into_owned(),
            })
            .await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Creates a playlist for `owner_id`. Returns false when the owner
    /// already has a playlist with this name.
    pub async fn create_playlist(&self, owner_id: &str, name: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM playlists WHERE owner_id = ?1 AND name = ?2",
                [owner_id, name],
            )
            .await?;
        if rows.next().await?.is_some() {
            return Ok(false);
        }

        self.conn
            .execute(
                "INSERT INTO playlists (owner_id, name) VALUES (:owner_id, :name)",
                params![owner_id, name],
            )
            .await?;
        Ok(true)
    }

    /// Deletes a playlist and, via cascade, its memberships. Returns false
    /// when no such playlist exists for this owner.
    pub async fn delete_playlist(&self, owner_id: &str, name: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM playlists WHERE owner_id = ?1 AND name = ?2",
                params![owner_id, name],
            )
            .await?;
        Ok(affected > 0)
    }

    /// All playlists of `owner_id` in creation order, each with its member
    /// filenames in insertion order. Empty playlists are included.
    pub async fn list_playlists(&self, owner_id: &str) -> Result<Vec<(String, Vec<String>)>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT p.name, m.filename
                FROM playlists p
                LEFT JOIN playlist_items i ON i.playlist_id = p.id
                LEFT JOIN media m ON m.id = i.media_id
                WHERE p.owner_id = ?1
                ORDER BY p.id ASC, i.id ASC
                "#,
            )
            .await?;

        let mut rows = stmt.query([owner_id]).await?;
        let mut playlists: Vec<(String, Vec<String>)> = Vec::new();
        while let Some(row) = rows.next().await? {
            let name: String = row.get(0)?;
            let filename: Option<String> = row.get(1)?;
            if playlists.last().map(|(last, _)| last.as_str()) != Some(name.as_str()) {
                playlists.push((name, Vec::new()));
            }
            if let Some(filename) = filename
                && let Some((_, items)) = playlists.last_mut()
            {
                items.push(filename);
            }
        }
        Ok(playlists)
    }

    /// Adds the owner's media record `filename` to their playlist `name`.
    /// Returns false when either side is missing; re-adding an existing
    /// member succeeds without duplicating the row.
    pub async fn add_playlist_item(
        &self,
        owner_id: &str,
        name: &str,
        filename: &str,
    ) -> Result<bool> {
        let Some((playlist_id, media_id)) =
            self.membership_ids(owner_id, name, filename).await?
        else {
            return Ok(false);
        };

        self.conn
            .execute(
                "INSERT OR IGNORE INTO playlist_items (playlist_id, media_id) VALUES (?1, ?2)",
                params![playlist_id, media_id],
            )
            .await?;
        Ok(true)
    }

    /// Removes the membership; removing a non-member is a no-op success.
    /// Returns false when playlist or media is missing.
    pub async fn remove_playlist_item(
        &self,
        owner_id: &str,
        name: &str,
        filename: &str,
    ) -> Result<bool> {
        let Some((playlist_id, media_id)) =
            self.membership_ids(owner_id, name, filename).await?
        else {
            return Ok(false);
        };

        self.conn
            .execute(
                "DELETE FROM playlist_items WHERE playlist_id = ?1 AND media_id = ?2",
                params![playlist_id, media_id],
            )
            .await?;
        Ok(true)
    }

    async fn membership_ids(
        &self,
        owner_id: &str,
        name: &str,
        filename: &str,
    ) -> Result<Option<(i64, i64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM playlists WHERE owner_id = ?1 AND name = ?2",
                [owner_id, name],
            )
            .await?;
        let Some(playlist_row) = rows.next().await? else {
            return Ok(None);
        };
        let playlist_id: i64 = playlist_row.get(0)?;

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM media WHERE owner_id = ?1 AND filename = ?2",
                [owner_id, filename],
            )
            .await?;
        let Some(media_row) = rows.next().await? else {
            return Ok(None);
        };
        let media_id: i64 = media_row.get(0)?;

        Ok(Some((playlist_id, media_id)))
    }
}

fn row_to_media(row: &Row) -> Result<MediaRecord> {
    // Column order must match the SELECT statements above.
    let media_type: String = row.get(5)?;
    let media_type = MediaType::parse(&media_type)
        .ok_or_else(|| anyhow!("unknown media_type {media_type:?} in catalog"))?;
    Ok(MediaRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        filename: row.get(2)?,
        original_url: row.get(3)?,
        title: row.get(4)?,
        media_type,
        storage_path: row.get(6)?,
        created_at: row.get(7)?,
    })
}
