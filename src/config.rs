#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_SUBTITLE_LANGS: &str = "en.*";
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;
pub const DEFAULT_SCAN_BATCH_DELAY_SECS: u64 = 5;
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
pub const CATALOG_DB_FILE: &str = "catalog.db";

/// Where the catalog lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogTarget {
    Local { db_path: PathBuf },
    Remote { base_url: String, token: Option<String> },
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub subscriptions_file: PathBuf,
    pub catalog: CatalogTarget,
    pub yt_dlp: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub subtitle_langs: String,
    pub scan_batch_size: usize,
    pub scan_batch_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub catalog_url: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = load_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;

    let subscriptions_file = lookup("SUBSCRIPTIONS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| media_root.join(SUBSCRIPTIONS_FILE));

    let catalog_url = overrides
        .catalog_url
        .and_then(non_blank)
        .or_else(|| lookup("CATALOG_URL"));
    let catalog = match catalog_url {
        Some(base_url) => CatalogTarget::Remote {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: lookup("CATALOG_TOKEN"),
        },
        None => CatalogTarget::Local {
            db_path: lookup("CATALOG_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| media_root.join(CATALOG_DB_FILE)),
        },
    };

    let scan_batch_size = lookup("SCAN_BATCH_SIZE")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_SCAN_BATCH_SIZE);
    let scan_batch_delay = lookup("SCAN_BATCH_DELAY_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SCAN_BATCH_DELAY_SECS));

    Ok(RuntimeConfig {
        subscriptions_file,
        catalog,
        yt_dlp: lookup("YT_DLP")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP)),
        cookies_file: lookup("COOKIES_FILE").map(PathBuf::from),
        subtitle_langs: lookup("SUBTITLE_LANGS")
            .unwrap_or_else(|| DEFAULT_SUBTITLE_LANGS.to_string()),
        scan_batch_size,
        scan_batch_delay,
        media_root,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

/// Settings this crate reads; anything else in the env file is ignored.
const KNOWN_KEYS: &[&str] = &[
    "MEDIA_ROOT",
    "SUBSCRIPTIONS_FILE",
    "CATALOG_URL",
    "CATALOG_TOKEN",
    "CATALOG_DB",
    "YT_DLP",
    "COOKIES_FILE",
    "SUBTITLE_LANGS",
    "SCAN_BATCH_SIZE",
    "SCAN_BATCH_DELAY_SECS",
];

/// Loads the recognised settings from a dotenv-style file. A missing file
/// yields no settings.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_env(&content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err).with_context(|| format!("Reading {}", path.display())),
    }
}

fn parse_env(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(setting_from_line)
        .filter(|(key, _)| {
            let known = KNOWN_KEYS.contains(key);
            if !known {
                debug!("Ignoring unknown setting {key}");
            }
            known
        })
        .map(|(key, value)| (key.to_string(), unquote(value).to_string()))
        .collect()
}

/// `KEY=value` with an optional `export ` prefix; comments and junk give `None`.
fn setting_from_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some((key, value.trim()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
