#![forbid(unsafe_code)]

//! Makes sure a channel is present on disk and in the catalog before any of
//! its videos are ingested.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mime_guess::mime::Mime;
use serde::Deserialize;
use tracing::{debug, info};

use crate::catalog::{CatalogClient, ChannelMetadata};
use crate::error::IngestError;
use crate::staging::{create_staging_dir, move_file};
use crate::ytdlp::ExtractionTool;

pub const CHANNEL_INFO_FILE: &str = "data.json";
const ASSET_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ASSET_BYTES: u64 = 32 * 1024 * 1024;

const AVATAR_THUMBNAIL_ID: &str = "avatar_uncropped";
const BANNER_UNCROPPED_THUMBNAIL_ID: &str = "banner_uncropped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetKind {
    Avatar,
    Banner,
    BannerUncropped,
}

impl AssetKind {
    const ALL: [AssetKind; 3] = [Self::Avatar, Self::Banner, Self::BannerUncropped];

    fn stem(self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Banner => "banner",
            Self::BannerUncropped => "banner_uncropped",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelInfo {
    id: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    title: Option<String>,
    uploader_id: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
struct Thumbnail {
    id: Option<serde_json::Value>,
    url: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
}

impl Thumbnail {
    fn id_is(&self, expected: &str) -> bool {
        self.id.as_ref().and_then(|id| id.as_str()) == Some(expected)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct AssetSelection {
    avatar: Option<String>,
    banner: Option<String>,
    banner_uncropped: Option<String>,
}

impl AssetSelection {
    fn urls(&self) -> impl Iterator<Item = (AssetKind, &str)> {
        [
            (AssetKind::Avatar, self.avatar.as_deref()),
            (AssetKind::Banner, self.banner.as_deref()),
            (AssetKind::BannerUncropped, self.banner_uncropped.as_deref()),
        ]
        .into_iter()
        .filter_map(|(kind, url)| url.map(|url| (kind, url)))
    }
}

/// Refs of asset files present in a channel directory.
#[derive(Debug, Default)]
struct AssetRefs {
    avatar: Option<String>,
    banner: Option<String>,
    banner_uncropped: Option<String>,
}

impl AssetRefs {
    fn set(&mut self, kind: AssetKind, file_name: String) {
        let slot = match kind {
            AssetKind::Avatar => &mut self.avatar,
            AssetKind::Banner => &mut self.banner,
            AssetKind::BannerUncropped => &mut self.banner_uncropped,
        };
        *slot = Some(file_name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelResolution {
    AlreadyCataloged,
    Registered,
}

pub struct ChannelResolver<'a, C> {
    catalog: &'a C,
    tool: &'a ExtractionTool,
    media_root: &'a Path,
    agent: ureq::Agent,
}

impl<'a, C: CatalogClient> ChannelResolver<'a, C> {
    pub fn new(catalog: &'a C, tool: &'a ExtractionTool, media_root: &'a Path) -> Self {
        Self {
            catalog,
            tool,
            media_root,
            agent: ureq::AgentBuilder::new().timeout(ASSET_TIMEOUT).build(),
        }
    }

    /// Registers `channel_id` if the catalog does not know it yet, reusing a
    /// previously downloaded `data.json` when one exists.
    pub async fn ensure_channel(
        &self,
        channel_id: &str,
        pending_title: Option<&str>,
    ) -> Result<ChannelResolution> {
        if self.catalog.has_channel(channel_id).await? {
            debug!("Channel {channel_id} already cataloged");
            return Ok(ChannelResolution::AlreadyCataloged);
        }

        let channel_dir = self.media_root.join(channel_id);
        let info_path = channel_dir.join(CHANNEL_INFO_FILE);
        if info_path.is_file() {
            info!("Reusing cached channel metadata for {channel_id}");
        } else {
            self.download_channel(channel_id, &channel_dir).await?;
        }

        let info = read_channel_info(&info_path)?;
        let assets = existing_assets(&channel_dir)?;
        let metadata = build_channel_metadata(channel_id, &info, assets, pending_title);
        self.catalog
            .add_channel(&metadata)
            .await
            .with_context(|| format!("registering channel {channel_id}"))?;
        info!("Registered channel {channel_id} ({})", metadata.display_name);
        Ok(ChannelResolution::Registered)
    }

    async fn download_channel(&self, channel_id: &str, channel_dir: &Path) -> Result<()> {
        let staging = create_staging_dir(self.media_root)?;
        self.tool
            .fetch_channel_info(staging.path(), channel_id)
            .await
            .with_context(|| format!("fetching channel info for {channel_id}"))?;

        let staged_info = single_info_document(staging.path())?;
        let info = read_channel_info(&staged_info)?;

        let mut staged_assets = Vec::new();
        for (kind, url) in select_assets(&info.thumbnails).urls() {
            let file_name = self
                .fetch_asset(url, kind, staging.path())
                .await
                .with_context(|| format!("fetching {} for {channel_id}", kind.stem()))?;
            staged_assets.push((kind, file_name));
        }

        fs::create_dir_all(channel_dir)
            .with_context(|| format!("creating {}", channel_dir.display()))?;
        for (kind, file_name) in &staged_assets {
            remove_assets_of_kind(channel_dir, *kind)?;
            move_file(&staging.path().join(file_name), &channel_dir.join(file_name))?;
        }
        move_file(&staged_info, &channel_dir.join(CHANNEL_INFO_FILE))?;
        Ok(())
    }

    /// Downloads one image into `dir`, naming it after its content type.
    async fn fetch_asset(&self, url: &str, kind: AssetKind, dir: &Path) -> Result<String> {
        let request = self.agent.get(url);
        let url = url.to_string();
        let dir = dir.to_path_buf();
        debug!("Fetching {} from {url}", kind.stem());

        tokio::task::spawn_blocking(move || -> Result<String> {
            let response = match request.call() {
                Ok(response) => response,
                Err(ureq::Error::Status(code, _)) => {
                    return Err(IngestError::Network(format!("GET {url} returned {code}")).into());
                }
                Err(err) => return Err(IngestError::Network(format!("GET {url}: {err}")).into()),
            };

            let content_type = response.header("Content-Type").unwrap_or_default();
            let Some(extension) = image_extension(content_type) else {
                return Err(IngestError::Network(format!(
                    "GET {url} returned unsupported content type {content_type:?}"
                ))
                .into());
            };

            let mut body = Vec::new();
            response
                .into_reader()
                .take(MAX_ASSET_BYTES + 1)
                .read_to_end(&mut body)
                .map_err(|err| IngestError::Network(format!("reading {url}: {err}")))?;
            if body.len() as u64 > MAX_ASSET_BYTES {
                return Err(IngestError::Network(format!(
                    "GET {url} exceeds the {MAX_ASSET_BYTES} byte size limit"
                ))
                .into());
            }

            let file_name = format!("{}.{extension}", kind.stem());
            let target = dir.join(&file_name);
            fs::write(&target, body).with_context(|| format!("writing {}", target.display()))?;
            Ok(file_name)
        })
        .await
        .context("asset download task panicked")?
    }
}

/// Maps an image `Content-Type` to the file extension used on disk.
fn image_extension(content_type: &str) -> Option<&'static str> {
    let mime: Mime = content_type.trim().parse().ok()?;
    match mime.essence_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

fn select_assets(thumbnails: &[Thumbnail]) -> AssetSelection {
    let url_for = |id: &str| {
        thumbnails
            .iter()
            .find(|thumb| thumb.id_is(id))
            .and_then(|thumb| thumb.url.clone())
    };

    let banner = thumbnails
        .iter()
        .filter(|thumb| {
            !thumb.id_is(AVATAR_THUMBNAIL_ID) && !thumb.id_is(BANNER_UNCROPPED_THUMBNAIL_ID)
        })
        .filter_map(|thumb| match (thumb.width, thumb.height, &thumb.url) {
            (Some(width), Some(height), Some(url)) if height > 0 && width > 2 * height => {
                Some((width, url))
            }
            _ => None,
        })
        .min_by_key(|(width, _)| *width)
        .map(|(_, url)| url.clone());

    AssetSelection {
        avatar: url_for(AVATAR_THUMBNAIL_ID),
        banner,
        banner_uncropped: url_for(BANNER_UNCROPPED_THUMBNAIL_ID),
    }
}

fn single_info_document(dir: &Path) -> Result<PathBuf> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".info.json"))
        {
            found.push(path);
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        count => bail!(
            "expected one channel info document in {}, found {count}",
            dir.display()
        ),
    }
}

fn read_channel_info(path: &Path) -> Result<ChannelInfo> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Deletes files left by an interrupted earlier download of the same asset,
/// whatever extension they were saved under.
fn remove_assets_of_kind(channel_dir: &Path, kind: AssetKind) -> Result<()> {
    for entry in
        fs::read_dir(channel_dir).with_context(|| format!("listing {}", channel_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.file_stem().and_then(|stem| stem.to_str()) == Some(kind.stem()) {
            debug!("Replacing leftover {}", path.display());
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
    }
    Ok(())
}

fn existing_assets(channel_dir: &Path) -> Result<AssetRefs> {
    let mut refs = AssetRefs::default();
    for entry in
        fs::read_dir(channel_dir).with_context(|| format!("listing {}", channel_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let (Some(stem), Some(name)) = (
            path.file_stem().and_then(|stem| stem.to_str()),
            path.file_name().and_then(|name| name.to_str()),
        ) else {
            continue;
        };
        if let Some(kind) = AssetKind::ALL.into_iter().find(|kind| kind.stem() == stem) {
            refs.set(kind, name.to_string());
        }
    }
    Ok(refs)
}

fn build_channel_metadata(
    channel_id: &str,
    info: &ChannelInfo,
    assets: AssetRefs,
    pending_title: Option<&str>,
) -> ChannelMetadata {
    if let Some(id) = info.id.as_deref()
        && id != channel_id
    {
        debug!("Channel info for {channel_id} reports id {id}");
    }

    let display_name = [
        info.channel.as_deref(),
        info.uploader.as_deref(),
        info.title.as_deref(),
        pending_title,
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|value| !value.is_empty())
    .unwrap_or(channel_id)
    .to_string();

    let short_id = info
        .uploader_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(channel_id)
        .to_string();

    ChannelMetadata {
        channel_id: channel_id.to_string(),
        display_name,
        short_id,
        description: info
            .description
            .clone()
            .filter(|description| !description.trim().is_empty()),
        avatar_ref: assets.avatar,
        banner_ref: assets.banner,
        banner_uncropped_ref: assets.banner_uncropped,
    }
}
