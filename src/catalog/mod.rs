#![forbid(unsafe_code)]

//! Catalog client used by the ingestion core.
//!
//! The catalog is the system of record for which channels and videos have
//! been archived. Two interchangeable backends exist: a local libsql file and
//! a remote HTTP API. Components take the client as a generic parameter so
//! tests can substitute their own.

mod local;
mod remote;

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::CatalogTarget;

pub use local::LocalCatalog;
pub use remote::RemoteCatalog;

/// Channel row as registered once its directory is in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub channel_id: String,
    pub display_name: String,
    pub short_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner_uncropped_ref: Option<String>,
}

/// Video row built from the committed `data.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_seconds: i64,
    /// Unix seconds, UTC.
    pub upload_timestamp: i64,
    #[serde(default)]
    pub subtitle_languages: BTreeSet<String>,
    pub media_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
}

/// Operations the ingestion core needs from the catalog.
///
/// Inserts must report duplicates and dangling channel references as errors
/// rather than ignoring them.
#[allow(async_fn_in_trait)]
pub trait CatalogClient {
    async fn has_video(&self, video_id: &str) -> Result<bool>;
    async fn has_channel(&self, channel_id: &str) -> Result<bool>;
    async fn add_channel(&self, channel: &ChannelMetadata) -> Result<()>;
    async fn add_video(&self, video: &VideoMetadata) -> Result<()>;
    /// Whether the backend is reachable. Local backends are always healthy.
    async fn healthcheck(&self) -> Result<bool>;
}

/// Backend picked from configuration.
#[derive(Debug)]
pub enum Catalog {
    Local(LocalCatalog),
    Remote(RemoteCatalog),
}

impl Catalog {
    pub async fn connect(target: &CatalogTarget) -> Result<Self> {
        match target {
            CatalogTarget::Local { db_path } => Ok(Self::Local(
                LocalCatalog::open(db_path)
                    .await
                    .context("opening local catalog")?,
            )),
            CatalogTarget::Remote { base_url, token } => Ok(Self::Remote(RemoteCatalog::new(
                base_url.clone(),
                token.clone(),
            ))),
        }
    }
}

impl CatalogClient for Catalog {
    async fn has_video(&self, video_id: &str) -> Result<bool> {
        match self {
            Self::Local(catalog) => catalog.has_video(video_id).await,
            Self::Remote(catalog) => catalog.has_video(video_id).await,
        }
    }

    async fn has_channel(&self, channel_id: &str) -> Result<bool> {
        match self {
            Self::Local(catalog) => catalog.has_channel(channel_id).await,
            Self::Remote(catalog) => catalog.has_channel(channel_id).await,
        }
    }

    async fn add_channel(&self, channel: &ChannelMetadata) -> Result<()> {
        match self {
            Self::Local(catalog) => catalog.add_channel(channel).await,
            Self::Remote(catalog) => catalog.add_channel(channel).await,
        }
    }

    async fn add_video(&self, video: &VideoMetadata) -> Result<()> {
        match self {
            Self::Local(catalog) => catalog.add_video(video).await,
            Self::Remote(catalog) => catalog.add_video(video).await,
        }
    }

    async fn healthcheck(&self) -> Result<bool> {
        match self {
            Self::Local(catalog) => catalog.healthcheck().await,
            Self::Remote(catalog) => catalog.healthcheck().await,
        }
    }
}
