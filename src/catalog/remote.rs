#![forbid(unsafe_code)]

//! Catalog reached over a JSON HTTP API.
//!
//! Endpoints, relative to the configured base URL:
//! * `GET  /api/healthcheck`
//! * `GET  /api/channels/{id}` and `GET /api/videos/{id}`: 200 known, 404 unknown
//! * `POST /api/channels` and `POST /api/videos`: 2xx created, 409 duplicate
//!
//! `ureq` is blocking, so every call runs on tokio's blocking pool.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::debug;

use super::{CatalogClient, ChannelMetadata, VideoMetadata};
use crate::error::IngestError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RemoteCatalog {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl RemoteCatalog {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    /// GET that maps 200 to `true` and 404 to `false`.
    async fn exists(&self, path: String) -> Result<bool> {
        let url = self.url(&path);
        let request = self.authorize(self.agent.get(&url));
        debug!("GET {url}");
        tokio::task::spawn_blocking(move || match request.call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(ureq::Error::Status(code, _)) => {
                Err(IngestError::Network(format!("GET {url} returned {code}")).into())
            }
            Err(err) => Err(IngestError::Network(format!("GET {url}: {err}")).into()),
        })
        .await
        .context("catalog request task panicked")?
    }

    async fn create<T: Serialize>(&self, path: &str, body: &T, label: String) -> Result<()> {
        let url = self.url(path);
        let request = self.authorize(self.agent.post(&url));
        let payload = serde_json::to_value(body).context("serializing catalog payload")?;
        debug!("POST {url}");
        tokio::task::spawn_blocking(move || match request.send_json(payload) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(409, _)) => bail!("catalog already contains {label}"),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                Err(anyhow!("catalog rejected {label} with {code}: {detail}"))
            }
            Err(err) => Err(IngestError::Network(format!("POST {url}: {err}")).into()),
        })
        .await
        .context("catalog request task panicked")?
    }
}

impl CatalogClient for RemoteCatalog {
    async fn has_video(&self, video_id: &str) -> Result<bool> {
        self.exists(format!("videos/{video_id}")).await
    }

    async fn has_channel(&self, channel_id: &str) -> Result<bool> {
        self.exists(format!("channels/{channel_id}")).await
    }

    async fn add_channel(&self, channel: &ChannelMetadata) -> Result<()> {
        self.create(
            "channels",
            channel,
            format!("channel {}", channel.channel_id),
        )
        .await
    }

    async fn add_video(&self, video: &VideoMetadata) -> Result<()> {
        self.create("videos", video, format!("video {}", video.video_id))
            .await
    }

    /// Any transport error or non-2xx answer counts as unhealthy.
    async fn healthcheck(&self) -> Result<bool> {
        let url = self.url("healthcheck");
        let request = self.authorize(self.agent.get(&url));
        let healthy = tokio::task::spawn_blocking(move || request.call().is_ok())
            .await
            .context("catalog healthcheck task panicked")?;
        Ok(healthy)
    }
}
