#![forbid(unsafe_code)]

//! One sync run: startup checks, backfill of pending subscriptions, then
//! incremental updates of onboarded channels.

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::catalog::CatalogClient;
use crate::channel::ChannelResolver;
use crate::config::RuntimeConfig;
use crate::error::{IngestError, kind_of};
use crate::ingest::{IngestOutcome, VideoIngestor};
use crate::playlist::{PlaylistScan, ScanMode, ScanSettings};
use crate::staging::check_stale_staging;
use crate::subscriptions::SubscriptionStore;
use crate::ytdlp::ExtractionTool;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Delete leftover staging directories instead of refusing to start.
    pub clean_stale_staging: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub channels_synced: usize,
    pub channels_failed: usize,
    pub channels_promoted: usize,
    pub videos_ingested: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.channels_failed == 0
    }
}

pub struct Pipeline<'a, C> {
    config: &'a RuntimeConfig,
    catalog: &'a C,
    tool: ExtractionTool,
}

impl<'a, C: CatalogClient> Pipeline<'a, C> {
    pub fn new(config: &'a RuntimeConfig, catalog: &'a C) -> Self {
        Self {
            config,
            catalog,
            tool: ExtractionTool::new(&config.yt_dlp, config.cookies_file.clone()),
        }
    }

    /// Checks that must pass before anything is downloaded.
    pub async fn preflight(&self, options: SyncOptions) -> Result<()> {
        let media_root = &self.config.media_root;
        if !media_root.is_dir() {
            return Err(IngestError::InvalidMediaRoot(media_root.clone()).into());
        }
        check_stale_staging(media_root, options.clean_stale_staging)?;
        if !self
            .catalog
            .healthcheck()
            .await
            .context("checking catalog health")?
        {
            return Err(IngestError::Network("catalog healthcheck failed".to_string()).into());
        }
        Ok(())
    }

    pub async fn run(
        &self,
        subscriptions: &mut SubscriptionStore,
        options: SyncOptions,
    ) -> Result<SyncReport> {
        self.preflight(options).await?;
        self.tool.ensure_available().await?;

        let mut report = SyncReport::default();
        let onboarded = subscriptions.subscribed().to_vec();

        let pending = subscriptions.subscribing().to_vec();
        if !pending.is_empty() {
            info!("Backfilling {} new channel(s)", pending.len());
        }
        for channel_id in pending {
            let title = subscriptions.title(&channel_id).map(str::to_owned);
            match self
                .sync_channel(&channel_id, ScanMode::Full, title.as_deref())
                .await
            {
                Ok(ingested) => {
                    report.videos_ingested += ingested;
                    report.channels_synced += 1;
                    subscriptions.promote(&channel_id)?;
                    report.channels_promoted += 1;
                }
                Err(err) => self.record_failure(&channel_id, err, &mut report)?,
            }
        }

        for channel_id in onboarded {
            match self
                .sync_channel(&channel_id, ScanMode::Incremental, None)
                .await
            {
                Ok(ingested) => {
                    report.videos_ingested += ingested;
                    report.channels_synced += 1;
                }
                Err(err) => self.record_failure(&channel_id, err, &mut report)?,
            }
        }

        info!(
            "Sync finished: {} channel(s) synced, {} failed, {} promoted, {} video(s) ingested",
            report.channels_synced,
            report.channels_failed,
            report.channels_promoted,
            report.videos_ingested
        );
        Ok(report)
    }

    /// Logs a channel failure; errors that invalidate the whole run are
    /// returned instead.
    fn record_failure(
        &self,
        channel_id: &str,
        err: anyhow::Error,
        report: &mut SyncReport,
    ) -> Result<()> {
        if let Some(IngestError::Consistency(_)) = kind_of(&err) {
            return Err(err);
        }
        error!("Channel {channel_id} failed: {err:#}");
        report.channels_failed += 1;
        Ok(())
    }

    async fn sync_channel(
        &self,
        channel_id: &str,
        mode: ScanMode,
        pending_title: Option<&str>,
    ) -> Result<usize> {
        info!("Syncing {channel_id} ({mode:?})");
        let media_root = self.config.media_root.as_path();

        ChannelResolver::new(self.catalog, &self.tool, media_root)
            .ensure_channel(channel_id, pending_title)
            .await
            .with_context(|| format!("resolving channel {channel_id}"))?;

        let ingestor = VideoIngestor::new(
            self.catalog,
            &self.tool,
            media_root,
            &self.config.subtitle_langs,
        );
        let mut scan = PlaylistScan::new(
            self.catalog,
            &self.tool,
            media_root,
            channel_id,
            mode,
            ScanSettings {
                batch_size: self.config.scan_batch_size,
                batch_delay: self.config.scan_batch_delay,
            },
        );

        let mut ingested = 0;
        while let Some(video_id) = scan.next().await? {
            match ingestor
                .ingest(channel_id, &video_id)
                .await
                .with_context(|| format!("ingesting {video_id} from {channel_id}"))?
            {
                IngestOutcome::Ingested => ingested += 1,
                IngestOutcome::AlreadyPresent { registered } => {
                    if registered {
                        warn!("{video_id} was on disk but missing from the catalog");
                    }
                }
            }
        }
        info!("{channel_id}: {ingested} new video(s)");
        Ok(ingested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocalCatalog;
    use crate::catalog::memory::MemoryCatalog;
    use crate::config::CatalogTarget;
    use crate::staging::STAGING_PREFIX;
    use crate::testing::{InstalledStub, StubScript, install_stub};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn runtime_config(media_root: &Path, stub: &InstalledStub) -> RuntimeConfig {
        RuntimeConfig {
            media_root: media_root.to_path_buf(),
            subscriptions_file: media_root.join("subscriptions.json"),
            catalog: CatalogTarget::Local {
                db_path: media_root.join("catalog.db"),
            },
            yt_dlp: stub.program.clone(),
            cookies_file: None,
            subtitle_langs: "en.*".to_string(),
            scan_batch_size: 2,
            scan_batch_delay: Duration::ZERO,
        }
    }

    fn write_subscriptions(path: &Path, raw: &str) -> Result<SubscriptionStore> {
        fs::write(path, raw)?;
        SubscriptionStore::load(path)
    }

    struct Sandbox {
        root: TempDir,
        _bin: TempDir,
        stub: InstalledStub,
        config: RuntimeConfig,
    }

    fn sandbox(script: StubScript) -> Result<Sandbox> {
        let root = tempdir()?;
        let bin = tempdir()?;
        let stub = install_stub(bin.path(), &script)?;
        let config = runtime_config(root.path(), &stub);
        Ok(Sandbox {
            root,
            _bin: bin,
            stub,
            config,
        })
    }

    #[tokio::test]
    async fn backfills_and_promotes_a_new_channel() -> Result<()> {
        let sb = sandbox(StubScript::with_listing(&["v1", "v2", "v3"]))?;
        let catalog = LocalCatalog::open(&sb.root.path().join("catalog.db")).await?;
        let mut subs = write_subscriptions(
            &sb.config.subscriptions_file,
            r#"{"subscribing":["UCabc"],"subscribed":[],"titles":{"UCabc":"Abc"}}"#,
        )?;

        let pipeline = Pipeline::new(&sb.config, &catalog);
        let report = pipeline.run(&mut subs, SyncOptions::default()).await?;

        assert_eq!(
            report,
            SyncReport {
                channels_synced: 1,
                channels_failed: 0,
                channels_promoted: 1,
                videos_ingested: 3,
            }
        );
        assert_eq!(catalog.count_channels().await?, 1);
        assert_eq!(catalog.count_videos().await?, 3);
        for video_id in ["v1", "v2", "v3"] {
            let video = catalog.get_video(video_id).await?.context("video row")?;
            assert_eq!(video.channel_id, "UCabc");
            let dir = sb.root.path().join("UCabc").join(video_id);
            assert!(dir.join("data.json").is_file());
            assert!(dir.join("video.mp4").is_file());
        }
        assert!(sb.root.path().join("UCabc/data.json").is_file());

        let reloaded = SubscriptionStore::load(&sb.config.subscriptions_file)?;
        assert!(reloaded.subscribing().is_empty());
        assert_eq!(reloaded.subscribed(), ["UCabc".to_string()]);
        assert!(reloaded.title("UCabc").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rerun_makes_no_catalog_writes() -> Result<()> {
        let sb = sandbox(StubScript::with_listing(&["v1", "v2", "v3"]))?;
        let catalog = MemoryCatalog::new();
        let mut subs = write_subscriptions(
            &sb.config.subscriptions_file,
            r#"{"subscribing":["UCabc"],"subscribed":[]}"#,
        )?;
        let pipeline = Pipeline::new(&sb.config, &catalog);
        pipeline.run(&mut subs, SyncOptions::default()).await?;
        let writes = catalog.writes.get();
        assert_eq!(writes, 4);

        let report = pipeline.run(&mut subs, SyncOptions::default()).await?;
        assert_eq!(report.videos_ingested, 0);
        assert_eq!(report.channels_synced, 1);
        assert_eq!(catalog.writes.get(), writes);

        let downloads = sb
            .stub
            .calls()?
            .into_iter()
            .filter(|call| call.contains("watch?v="))
            .count();
        assert_eq!(downloads, 3);
        Ok(())
    }

    #[tokio::test]
    async fn incremental_update_picks_up_new_uploads() -> Result<()> {
        let sb = sandbox(StubScript::with_listing(&["v4", "v3", "v2", "v1"]))?;
        let catalog = LocalCatalog::open(&sb.root.path().join("catalog.db")).await?;
        let mut subs = write_subscriptions(
            &sb.config.subscriptions_file,
            r#"{"subscribing":["UCabc"],"subscribed":[]}"#,
        )?;
        let pipeline = Pipeline::new(&sb.config, &catalog);
        pipeline.run(&mut subs, SyncOptions::default()).await?;
        assert_eq!(catalog.count_videos().await?, 4);

        let later_bin = tempdir()?;
        let later = install_stub(
            later_bin.path(),
            &StubScript::with_listing(&["v6", "v5", "v4", "v3", "v2", "v1"]),
        )?;
        let mut config = sb.config.clone();
        config.yt_dlp = later.program.clone();
        let pipeline = Pipeline::new(&config, &catalog);
        let report = pipeline.run(&mut subs, SyncOptions::default()).await?;

        assert_eq!(report.videos_ingested, 2);
        assert_eq!(report.channels_promoted, 0);
        assert_eq!(catalog.count_videos().await?, 6);
        assert_eq!(later.calls_matching("--playlist-items 3:4")?.len(), 1);
        assert!(later.calls_matching("--playlist-items 5:6")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_channel_stays_pending() -> Result<()> {
        let script = StubScript::with_listing(&["v1", "v2"]).failing_video("v2");
        let sb = sandbox(script)?;
        let catalog = MemoryCatalog::new();
        let mut subs = write_subscriptions(
            &sb.config.subscriptions_file,
            r#"{"subscribing":["UCabc"],"subscribed":[]}"#,
        )?;

        let report = Pipeline::new(&sb.config, &catalog)
            .run(&mut subs, SyncOptions::default())
            .await?;
        assert_eq!(report.channels_failed, 1);
        assert_eq!(report.channels_promoted, 0);
        assert!(!report.is_clean());
        assert_eq!(subs.subscribing(), ["UCabc".to_string()]);
        assert!(catalog.videos.borrow().contains_key("v1"));
        assert!(!sb.root.path().join("UCabc/v2").exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_staging_blocks_the_run() -> Result<()> {
        let sb = sandbox(StubScript::with_listing(&["v1"]))?;
        let leftover = sb.root.path().join(format!("{STAGING_PREFIX}old"));
        fs::create_dir(&leftover)?;
        let catalog = MemoryCatalog::new();
        let mut subs = write_subscriptions(
            &sb.config.subscriptions_file,
            r#"{"subscribing":["UCabc"],"subscribed":[]}"#,
        )?;
        let pipeline = Pipeline::new(&sb.config, &catalog);

        let err = pipeline
            .run(&mut subs, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(IngestError::StaleStaging(_))));
        assert!(sb.stub.calls()?.is_empty());

        let report = pipeline
            .run(
                &mut subs,
                SyncOptions {
                    clean_stale_staging: true,
                },
            )
            .await?;
        assert_eq!(report.videos_ingested, 1);
        assert!(!leftover.exists());
        Ok(())
    }

    #[tokio::test]
    async fn unhealthy_catalog_is_fatal() -> Result<()> {
        let sb = sandbox(StubScript::new())?;
        let catalog = MemoryCatalog::new();
        catalog.healthy.set(false);
        let mut subs = SubscriptionStore::load(&sb.config.subscriptions_file)?;

        let err = Pipeline::new(&sb.config, &catalog)
            .run(&mut subs, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(IngestError::Network(_))));
        Ok(())
    }

    #[tokio::test]
    async fn missing_media_root_is_fatal() -> Result<()> {
        let sb = sandbox(StubScript::new())?;
        let mut config = sb.config.clone();
        config.media_root = sb.root.path().join("absent");
        let catalog = MemoryCatalog::new();
        let mut subs = SubscriptionStore::load(&sb.config.subscriptions_file)?;

        let err = Pipeline::new(&config, &catalog)
            .run(&mut subs, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(IngestError::InvalidMediaRoot(_))
        ));
        Ok(())
    }
}
