#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newtube_ingest::{
    catalog::Catalog,
    config::{DEFAULT_ENV_PATH, RuntimeOverrides, resolve_runtime_config},
    logging::init_logging,
    pipeline::{Pipeline, SyncOptions},
    security::ensure_not_root,
    subscriptions::{SubscribeOutcome, SubscriptionStore},
};
use tracing::{Level, error, info};

/// Mirrors subscribed channels into the media root and catalogs them.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Archive root; overrides MEDIA_ROOT
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,

    /// Environment file to read settings from
    #[arg(long, global = true, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,

    /// Remote catalog base URL; overrides CATALOG_URL
    #[arg(long, global = true)]
    catalog_url: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backfill pending channels, then fetch new uploads of subscribed ones
    Sync {
        /// Delete leftover staging directories instead of refusing to start
        #[arg(long)]
        clean_stale_staging: bool,
    },
    /// Queue a channel for its first full sync
    Subscribe {
        channel_id: String,
        /// Display name used until the channel metadata is fetched
        #[arg(long)]
        title: Option<String>,
    },
    /// Show tracked channels and catalog totals
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(err) = init_logging(level) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command finished without per-channel failures.
async fn run(cli: Cli) -> Result<bool> {
    ensure_not_root("sync_channels")?;
    let config = resolve_runtime_config(RuntimeOverrides {
        media_root: cli.media_root,
        catalog_url: cli.catalog_url,
        env_path: Some(cli.env_file),
    })?;
    let mut subscriptions = SubscriptionStore::load(&config.subscriptions_file)?;

    match cli.command {
        Command::Sync {
            clean_stale_staging,
        } => {
            let catalog = Catalog::connect(&config.catalog).await?;
            let report = Pipeline::new(&config, &catalog)
                .run(&mut subscriptions, SyncOptions { clean_stale_staging })
                .await?;
            if !report.is_clean() {
                error!(
                    "{} channel(s) failed; see the log above",
                    report.channels_failed
                );
            }
            Ok(report.is_clean())
        }
        Command::Subscribe { channel_id, title } => {
            let channel_id = channel_id.trim();
            anyhow::ensure!(!channel_id.is_empty(), "channel id must not be empty");
            match subscriptions.subscribe(channel_id, title.as_deref())? {
                SubscribeOutcome::Added => info!("Queued {channel_id} for its first sync"),
                SubscribeOutcome::AlreadyPending => {
                    info!("{channel_id} is already waiting for its first sync")
                }
                SubscribeOutcome::AlreadySubscribed => info!("{channel_id} is already subscribed"),
            }
            Ok(true)
        }
        Command::Status => {
            print_status(&subscriptions);
            let catalog = Catalog::connect(&config.catalog).await?;
            if let Catalog::Local(local) = &catalog {
                let channels = local.count_channels().await.context("counting channels")?;
                let videos = local.count_videos().await.context("counting videos")?;
                println!("catalog: {channels} channel(s), {videos} video(s)");
            } else {
                println!("catalog: remote");
            }
            Ok(true)
        }
    }
}

fn print_status(subscriptions: &SubscriptionStore) {
    println!("subscribing ({}):", subscriptions.subscribing().len());
    for id in subscriptions.subscribing() {
        match subscriptions.title(id) {
            Some(title) => println!("  {id}  {title}"),
            None => println!("  {id}"),
        }
    }
    println!("subscribed ({}):", subscriptions.subscribed().len());
    for id in subscriptions.subscribed() {
        println!("  {id}");
    }
}
