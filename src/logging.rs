#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber for a binary.
///
/// `RUST_LOG` takes precedence; otherwise this crate logs at `level` and
/// everything else at `warn`.
pub fn init_logging(level: Level) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(custom) if !custom.trim().is_empty() => EnvFilter::try_new(custom),
        _ => EnvFilter::try_new(default_directives(level)),
    }
    .map_err(|err| anyhow!("invalid log filter: {err}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))
}

fn default_directives(level: Level) -> String {
    format!(
        "warn,{}={},sync_channels={}",
        env!("CARGO_CRATE_NAME"),
        level,
        level
    )
}
