#![forbid(unsafe_code)]

//! Enumerates a channel's uploads and yields the ones the catalog lacks.
//!
//! Listings come newest first. A full scan walks the whole list once; an
//! incremental scan pages through fixed windows and stops at the first video
//! the catalog already knows.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::catalog::CatalogClient;
use crate::ytdlp::{ExtractionTool, ItemWindow, video_id_from_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

/// Pull-based, single-use scan over one channel.
pub struct PlaylistScan<'a, C> {
    catalog: &'a C,
    tool: &'a ExtractionTool,
    workdir: &'a Path,
    channel_id: String,
    mode: ScanMode,
    settings: ScanSettings,
    buffer: VecDeque<String>,
    next_start: usize,
    delay_before_next: bool,
    exhausted: bool,
}

impl<'a, C: CatalogClient> PlaylistScan<'a, C> {
    pub fn new(
        catalog: &'a C,
        tool: &'a ExtractionTool,
        workdir: &'a Path,
        channel_id: &str,
        mode: ScanMode,
        settings: ScanSettings,
    ) -> Self {
        Self {
            catalog,
            tool,
            workdir,
            channel_id: channel_id.to_string(),
            mode,
            settings: ScanSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            buffer: VecDeque::new(),
            next_start: 1,
            delay_before_next: false,
            exhausted: false,
        }
    }

    /// Next unseen video id, or `None` once the scan is done.
    pub async fn next(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(video_id) = self.buffer.pop_front() {
                let known = self
                    .catalog
                    .has_video(&video_id)
                    .await
                    .with_context(|| format!("checking catalog for {video_id}"))?;
                match (known, self.mode) {
                    (false, _) => return Ok(Some(video_id)),
                    (true, ScanMode::Full) => continue,
                    (true, ScanMode::Incremental) => {
                        debug!(
                            "{video_id} already cataloged, {} is up to date",
                            self.channel_id
                        );
                        self.finish();
                        return Ok(None);
                    }
                }
            }

            if self.exhausted {
                return Ok(None);
            }
            match self.mode {
                ScanMode::Full => self.fetch_everything().await?,
                ScanMode::Incremental => self.fetch_window().await?,
            }
        }
    }

    fn finish(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
    }

    async fn fetch_everything(&mut self) -> Result<()> {
        let urls = self
            .tool
            .list_video_urls(self.workdir, &self.channel_id, None)
            .await
            .with_context(|| format!("listing uploads of {}", self.channel_id))?;
        info!("{} lists {} videos", self.channel_id, urls.len());
        self.buffer = parse_ids(&urls)?;
        self.exhausted = true;
        Ok(())
    }

    async fn fetch_window(&mut self) -> Result<()> {
        if self.delay_before_next && !self.settings.batch_delay.is_zero() {
            debug!(
                "Waiting {:?} before the next window",
                self.settings.batch_delay
            );
            tokio::time::sleep(self.settings.batch_delay).await;
        }

        let window = ItemWindow {
            start: self.next_start,
            end: self.next_start + self.settings.batch_size - 1,
        };
        let urls = self
            .tool
            .list_video_urls(self.workdir, &self.channel_id, Some(window))
            .await
            .with_context(|| {
                format!(
                    "listing uploads {}-{} of {}",
                    window.start, window.end, self.channel_id
                )
            })?;
        debug!(
            "Window {}-{} of {} returned {} items",
            window.start,
            window.end,
            self.channel_id,
            urls.len()
        );

        self.buffer = parse_ids(&urls)?;
        if urls.len() < self.settings.batch_size {
            self.exhausted = true;
        } else {
            self.next_start = window.end + 1;
            self.delay_before_next = true;
        }
        Ok(())
    }
}

fn parse_ids(urls: &[String]) -> Result<VecDeque<String>> {
    urls.iter()
        .map(|url| video_id_from_url(url).map_err(anyhow::Error::from))
        .collect()
}
