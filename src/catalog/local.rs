#![forbid(unsafe_code)]

//! libsql-backed catalog stored next to the media tree.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use libsql::{Builder, Connection, Row, params};

use super::{CatalogClient, ChannelMetadata, VideoMetadata};

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
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
        CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            short_id TEXT NOT NULL,
            description TEXT,
            avatar_ref TEXT,
            banner_ref TEXT,
            banner_uncropped_ref TEXT
        );

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(channel_id),
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            duration_seconds INTEGER NOT NULL,
            upload_timestamp INTEGER NOT NULL,
            subtitle_languages_json TEXT NOT NULL DEFAULT '[]',
            media_ref TEXT NOT NULL,
            thumbnail_ref TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id, upload_timestamp);
        "#,
    )
    .await?;
    Ok(())
}

/// Catalog kept in a local SQLite-compatible file.
#[derive(Debug)]
pub struct LocalCatalog {
    conn: Connection,
}

impl LocalCatalog {
    /// Opens (and if necessary creates) the database and its tables.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
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

    async fn exists(&self, sql: &str, id: &str) -> Result<bool> {
        let mut rows = self.conn.query(sql, [id]).await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelMetadata>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT channel_id, display_name, short_id, description,
                       avatar_ref, banner_ref, banner_uncropped_ref
                FROM channels
                WHERE channel_id = ?1
                "#,
                [channel_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoMetadata>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, channel_id, title, description, duration_seconds,
                       upload_timestamp, subtitle_languages_json, media_ref, thumbnail_ref
                FROM videos
                WHERE video_id = ?1
                "#,
                [video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn count_channels(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM channels").await
    }

    pub async fn count_videos(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM videos").await
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self.conn.query(sql, params![]).await?;
        let row = rows.next().await?.context("missing COUNT row")?;
        let count: i64 = row.get(0)?;
        Ok(count as u64)
    }
}

impl CatalogClient for LocalCatalog {
    async fn has_video(&self, video_id: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM videos WHERE video_id = ?1", video_id)
            .await
            .with_context(|| format!("looking up video {video_id}"))
    }

    async fn has_channel(&self, channel_id: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM channels WHERE channel_id = ?1", channel_id)
            .await
            .with_context(|| format!("looking up channel {channel_id}"))
    }

    /// Plain INSERT: a second registration of the same channel fails.
    async fn add_channel(&self, channel: &ChannelMetadata) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO channels (
                    channel_id, display_name, short_id, description,
                    avatar_ref, banner_ref, banner_uncropped_ref
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    channel.channel_id.as_str(),
                    channel.display_name.as_str(),
                    channel.short_id.as_str(),
                    channel.description.as_deref(),
                    channel.avatar_ref.as_deref(),
                    channel.banner_ref.as_deref(),
                    channel.banner_uncropped_ref.as_deref(),
                ],
            )
            .await
            .with_context(|| format!("inserting channel {}", channel.channel_id))?;
        Ok(())
    }

    /// Plain INSERT guarded by the channel foreign key.
    async fn add_video(&self, video: &VideoMetadata) -> Result<()> {
        let languages_json = serde_json::to_string(&video.subtitle_languages)
            .context("serializing subtitle languages")?;

        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    video_id, channel_id, title, description, duration_seconds,
                    upload_timestamp, subtitle_languages_json, media_ref, thumbnail_ref
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    video.video_id.as_str(),
                    video.channel_id.as_str(),
                    video.title.as_str(),
                    video.description.as_str(),
                    video.duration_seconds,
                    video.upload_timestamp,
                    languages_json,
                    video.media_ref.as_str(),
                    video.thumbnail_ref.as_deref(),
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", video.video_id))?;
        Ok(())
    }

    async fn healthcheck(&self) -> Result<bool> {
        Ok(true)
    }
}

// Column order must match the SELECT in get_channel.
fn row_to_channel(row: &Row) -> Result<ChannelMetadata> {
    Ok(ChannelMetadata {
        channel_id: row.get(0)?,
        display_name: row.get(1)?,
        short_id: row.get(2)?,
        description: row.get(3)?,
        avatar_ref: row.get(4)?,
        banner_ref: row.get(5)?,
        banner_uncropped_ref: row.get(6)?,
    })
}

// Column order must match the SELECT in get_video.
fn row_to_video(row: &Row) -> Result<VideoMetadata> {
    let languages_json: String = row.get(6)?;
    let subtitle_languages: BTreeSet<String> =
        serde_json::from_str(&languages_json).context("parsing stored subtitle languages")?;

    Ok(VideoMetadata {
        video_id: row.get(0)?,
        channel_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        duration_seconds: row.get(4)?,
        upload_timestamp: row.get(5)?,
        subtitle_languages,
        media_ref: row.get(7)?,
        thumbnail_ref: row.get(8)?,
    })
}
