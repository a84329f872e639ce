#![forbid(unsafe_code)]

//! Downloads, validates, commits and catalogs a single video.
//!
//! A video directory under `<media_root>/<channel_id>/<video_id>/` is only
//! ever populated from a staging directory whose contents passed validation,
//! so a directory holding both `data.json` and a media file is complete.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogClient, VideoMetadata};
use crate::error::IngestError;
use crate::staging::{create_staging_dir, move_file};
use crate::ytdlp::ExtractionTool;

pub const VIDEO_INFO_FILE: &str = "data.json";
const MEDIA_EXTENSIONS: [&str; 2] = ["mp4", "webm"];
const THUMBNAIL_EXTENSIONS: [&str; 4] = ["png", "webp", "jpg", "gif"];
const SUBTITLE_EXTENSION: &str = "vtt";

/// Progress of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    New,
    Staging,
    Validated,
    Committed,
    Cataloged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested,
    /// Files were already committed; `registered` tells whether the catalog
    /// entry had to be added.
    AlreadyPresent { registered: bool },
}

#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    timestamp: Option<i64>,
    release_timestamp: Option<i64>,
    upload_date: Option<String>,
}

/// Files found in a staging directory that passed validation.
#[derive(Debug)]
struct StagedDownload {
    info: PathBuf,
    media: PathBuf,
    thumbnail: PathBuf,
    /// Language tag to file.
    subtitles: BTreeMap<String, PathBuf>,
}

pub struct VideoIngestor<'a, C> {
    catalog: &'a C,
    tool: &'a ExtractionTool,
    media_root: &'a Path,
    subtitle_langs: &'a str,
}

impl<'a, C: CatalogClient> VideoIngestor<'a, C> {
    pub fn new(
        catalog: &'a C,
        tool: &'a ExtractionTool,
        media_root: &'a Path,
        subtitle_langs: &'a str,
    ) -> Self {
        Self {
            catalog,
            tool,
            media_root,
            subtitle_langs,
        }
    }

    pub async fn ingest(&self, channel_id: &str, video_id: &str) -> Result<IngestOutcome> {
        let video_dir = self.media_root.join(channel_id).join(video_id);
        let mut state = IngestState::New;
        debug!("{video_id}: {state:?}");

        let has_info = video_dir.join(VIDEO_INFO_FILE).is_file();
        let has_media = committed_media(&video_dir).is_some();
        match (has_info, has_media) {
            (true, true) => return self.register_existing(channel_id, video_id, &video_dir).await,
            (true, false) => {
                return Err(IngestError::ReferentialInconsistency {
                    path: video_dir,
                    reason: format!("{VIDEO_INFO_FILE} present without a media file"),
                }
                .into());
            }
            (false, true) => {
                return Err(IngestError::ReferentialInconsistency {
                    path: video_dir,
                    reason: format!("media file present without {VIDEO_INFO_FILE}"),
                }
                .into());
            }
            (false, false) => {}
        }

        state = IngestState::Staging;
        debug!("{video_id}: {state:?}");
        let staging = create_staging_dir(self.media_root)?;
        self.tool
            .download_video(staging.path(), video_id, self.subtitle_langs)
            .await
            .with_context(|| format!("downloading {video_id}"))?;

        let staged = validate_staging(staging.path(), video_id)?;
        state = IngestState::Validated;
        debug!("{video_id}: {state:?}");

        commit(&staged, &video_dir)?;
        state = IngestState::Committed;
        debug!("{video_id}: {state:?}");
        drop(staging);

        let metadata = read_committed(channel_id, video_id, &video_dir)?;
        self.catalog
            .add_video(&metadata)
            .await
            .with_context(|| format!("registering video {video_id}"))?;
        state = IngestState::Cataloged;
        debug!("{video_id}: {state:?}");
        info!("Ingested {video_id}: {}", metadata.title);
        Ok(IngestOutcome::Ingested)
    }

    async fn register_existing(
        &self,
        channel_id: &str,
        video_id: &str,
        video_dir: &Path,
    ) -> Result<IngestOutcome> {
        if self.catalog.has_video(video_id).await? {
            debug!("{video_id} already on disk and cataloged");
            return Ok(IngestOutcome::AlreadyPresent { registered: false });
        }
        let metadata = read_committed(channel_id, video_id, video_dir)?;
        self.catalog
            .add_video(&metadata)
            .await
            .with_context(|| format!("registering existing video {video_id}"))?;
        info!("Registered {video_id} from existing files");
        Ok(IngestOutcome::AlreadyPresent { registered: true })
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn committed_media(video_dir: &Path) -> Option<PathBuf> {
    MEDIA_EXTENSIONS
        .iter()
        .map(|ext| video_dir.join(format!("video.{ext}")))
        .find(|path| path.is_file())
}

/// Language tag of a subtitle file: the last dot-separated segment before
/// `.vtt`, e.g. `video.en-GB.vtt` is `en-GB`.
fn subtitle_language(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".vtt")?;
    let (_, lang) = stem.rsplit_once('.')?;
    (!lang.is_empty()).then_some(lang)
}

fn validate_staging(dir: &Path, video_id: &str) -> Result<StagedDownload> {
    let violation = |reason: String| IngestError::IntegrityViolation {
        video_id: video_id.to_string(),
        reason,
    };

    let mut infos = Vec::new();
    let mut media = Vec::new();
    let mut thumbnails = Vec::new();
    let mut subtitles = BTreeMap::new();
    let mut entries = 0usize;

    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        entries += 1;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let extension = extension_of(&path).unwrap_or_default();

        if name.ends_with(".info.json") {
            infos.push(path);
        } else if MEDIA_EXTENSIONS.contains(&extension.as_str()) {
            media.push(path);
        } else if THUMBNAIL_EXTENSIONS.contains(&extension.as_str()) {
            thumbnails.push(path);
        } else if extension == SUBTITLE_EXTENSION {
            let Some(lang) = subtitle_language(name) else {
                return Err(violation(format!("subtitle {name} has no language tag")).into());
            };
            if subtitles.insert(lang.to_string(), path.clone()).is_some() {
                return Err(violation(format!("two subtitle files for language {lang}")).into());
            }
        }
    }

    for (label, found) in [
        ("metadata", &infos),
        ("media", &media),
        ("thumbnail", &thumbnails),
    ] {
        if found.len() != 1 {
            return Err(violation(format!(
                "expected exactly one {label} file, found {}",
                found.len()
            ))
            .into());
        }
    }
    let expected = subtitles.len() + 3;
    if entries != expected {
        return Err(violation(format!(
            "expected {expected} entries, found {entries}"
        ))
        .into());
    }

    Ok(StagedDownload {
        info: infos.remove(0),
        media: media.remove(0),
        thumbnail: thumbnails.remove(0),
        subtitles,
    })
}

fn commit(staged: &StagedDownload, video_dir: &Path) -> Result<()> {
    fs::create_dir_all(video_dir).with_context(|| format!("creating {}", video_dir.display()))?;

    let media_ext = extension_of(&staged.media).unwrap_or_default();
    move_file(&staged.media, &video_dir.join(format!("video.{media_ext}")))?;
    let thumb_ext = extension_of(&staged.thumbnail).unwrap_or_default();
    move_file(
        &staged.thumbnail,
        &video_dir.join(format!("thumb.{thumb_ext}")),
    )?;
    for (lang, path) in &staged.subtitles {
        move_file(path, &video_dir.join(format!("subs.{lang}.vtt")))?;
    }
    // Last, so a partial commit is caught as an inconsistency on the next run.
    move_file(&staged.info, &video_dir.join(VIDEO_INFO_FILE))?;
    Ok(())
}

/// Builds catalog metadata from what is actually in the video directory.
fn read_committed(channel_id: &str, video_id: &str, video_dir: &Path) -> Result<VideoMetadata> {
    let info_path = video_dir.join(VIDEO_INFO_FILE);
    let raw = fs::read_to_string(&info_path)
        .with_context(|| format!("reading {}", info_path.display()))?;
    let info: VideoInfo = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", info_path.display()))?;

    if let Some(id) = info.id.as_deref()
        && id != video_id
    {
        return Err(IngestError::IntegrityViolation {
            video_id: video_id.to_string(),
            reason: format!("{} describes video {id}", info_path.display()),
        }
        .into());
    }

    let media = committed_media(video_dir).ok_or_else(|| IngestError::ReferentialInconsistency {
        path: video_dir.to_path_buf(),
        reason: "media file disappeared".to_string(),
    })?;

    let mut thumbnail_ref = None;
    let mut subtitle_languages = BTreeSet::new();
    for entry in fs::read_dir(video_dir).with_context(|| format!("listing {}", video_dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if path.file_stem().and_then(|stem| stem.to_str()) == Some("thumb") {
            thumbnail_ref = Some(name.to_string());
        } else if let Some(lang) = name
            .strip_prefix("subs.")
            .and_then(|rest| rest.strip_suffix(".vtt"))
        {
            subtitle_languages.insert(lang.to_string());
        }
    }

    let upload_timestamp = upload_timestamp(video_id, &info);
    Ok(VideoMetadata {
        video_id: video_id.to_string(),
        channel_id: channel_id.to_string(),
        title: info
            .title
            .or(info.fulltitle)
            .unwrap_or_else(|| video_id.to_string()),
        description: info.description.unwrap_or_default(),
        duration_seconds: info.duration.map(|secs| secs.round() as i64).unwrap_or(0),
        upload_timestamp,
        subtitle_languages,
        media_ref: media
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string(),
        thumbnail_ref,
    })
}

fn upload_timestamp(video_id: &str, info: &VideoInfo) -> i64 {
    if let Some(ts) = info.timestamp.or(info.release_timestamp) {
        return ts;
    }
    let parsed = info
        .upload_date
        .as_deref()
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y%m%d").ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp());
    parsed.unwrap_or_else(|| {
        warn!("{video_id} has no usable upload date, storing 0");
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::MemoryCatalog;
    use crate::catalog::ChannelMetadata;
    use crate::error::kind_of;
    use crate::staging::find_stale_staging;
    use crate::testing::{InstalledStub, StubScript, install_stub};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        root: TempDir,
        _bin: TempDir,
        stub: InstalledStub,
        tool: ExtractionTool,
        catalog: MemoryCatalog,
    }

    async fn fixture(script: StubScript) -> Result<Fixture> {
        let root = tempdir()?;
        let bin = tempdir()?;
        let stub = install_stub(bin.path(), &script)?;
        let tool = ExtractionTool::new(&stub.program, None);
        let catalog = MemoryCatalog::new();
        catalog
            .add_channel(&ChannelMetadata {
                channel_id: "UCabc".into(),
                display_name: "Abc".into(),
                short_id: "@abc".into(),
                description: None,
                avatar_ref: None,
                banner_ref: None,
                banner_uncropped_ref: None,
            })
            .await?;
        catalog.writes.set(0);
        Ok(Fixture {
            root,
            _bin: bin,
            stub,
            tool,
            catalog,
        })
    }

    impl Fixture {
        fn ingestor(&self) -> VideoIngestor<'_, MemoryCatalog> {
            VideoIngestor::new(&self.catalog, &self.tool, self.root.path(), "en.*")
        }

        fn video_dir(&self, video_id: &str) -> PathBuf {
            self.root.path().join("UCabc").join(video_id)
        }
    }

    #[tokio::test]
    async fn ingests_and_catalogs_a_new_video() -> Result<()> {
        let fx = fixture(StubScript::new()).await?;
        assert_eq!(
            fx.ingestor().ingest("UCabc", "vid1").await?,
            IngestOutcome::Ingested
        );

        let dir = fx.video_dir("vid1");
        let mut names: Vec<String> = fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        assert_eq!(
            names,
            vec!["data.json", "subs.en.vtt", "thumb.webp", "video.mp4"]
        );
        assert!(find_stale_staging(fx.root.path())?.is_empty());

        let videos = fx.catalog.videos.borrow();
        let video = videos.get("vid1").context("video registered")?;
        assert_eq!(video.title, "Title vid1");
        assert_eq!(video.channel_id, "UCabc");
        assert_eq!(video.duration_seconds, 61);
        assert_eq!(video.upload_timestamp, 1_704_153_600);
        assert_eq!(video.media_ref, "video.mp4");
        assert_eq!(video.thumbnail_ref.as_deref(), Some("thumb.webp"));
        assert_eq!(
            video.subtitle_languages,
            BTreeSet::from(["en".to_string()])
        );

        let call = &fx.stub.calls()?[0];
        assert!(call.contains("--sub-langs en.* --sub-format vtt"));
        assert!(call.contains("--format bv*+ba/b"));
        Ok(())
    }

    #[tokio::test]
    async fn second_run_makes_no_writes() -> Result<()> {
        let fx = fixture(StubScript::new()).await?;
        fx.ingestor().ingest("UCabc", "vid1").await?;
        let writes = fx.catalog.writes.get();

        assert_eq!(
            fx.ingestor().ingest("UCabc", "vid1").await?,
            IngestOutcome::AlreadyPresent { registered: false }
        );
        assert_eq!(fx.catalog.writes.get(), writes);
        assert_eq!(fx.stub.calls()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn committed_files_missing_from_catalog_are_registered() -> Result<()> {
        let fx = fixture(StubScript::new()).await?;
        let dir = fx.video_dir("vid9");
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join(VIDEO_INFO_FILE),
            r#"{"id": "vid9", "fulltitle": "Nine", "release_timestamp": 1700000000}"#,
        )?;
        fs::write(dir.join("video.webm"), "media")?;
        fs::write(dir.join("subs.de.vtt"), "WEBVTT")?;

        assert_eq!(
            fx.ingestor().ingest("UCabc", "vid9").await?,
            IngestOutcome::AlreadyPresent { registered: true }
        );
        assert!(fx.stub.calls()?.is_empty());
        let videos = fx.catalog.videos.borrow();
        let video = videos.get("vid9").context("video registered")?;
        assert_eq!(video.title, "Nine");
        assert_eq!(video.upload_timestamp, 1_700_000_000);
        assert_eq!(video.media_ref, "video.webm");
        assert_eq!(video.thumbnail_ref, None);
        Ok(())
    }

    #[tokio::test]
    async fn two_media_files_violate_integrity() -> Result<()> {
        let fx = fixture(StubScript::new().extra_download_file("video.webm")).await?;
        let err = fx.ingestor().ingest("UCabc", "vid1").await.unwrap_err();

        assert!(matches!(
            kind_of(&err),
            Some(IngestError::IntegrityViolation { .. })
        ));
        assert!(!fx.video_dir("vid1").exists());
        assert!(find_stale_staging(fx.root.path())?.is_empty());
        assert_eq!(fx.catalog.writes.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stray_file_violates_integrity() -> Result<()> {
        let fx = fixture(StubScript::new().extra_download_file("video.f137.mp4.part")).await?;
        let err = fx.ingestor().ingest("UCabc", "vid1").await.unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(IngestError::IntegrityViolation { .. })
        ));
        assert!(!fx.video_dir("vid1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn media_without_metadata_is_inconsistent() -> Result<()> {
        let fx = fixture(StubScript::new()).await?;
        let dir = fx.video_dir("vid1");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("video.mp4"), "media")?;

        let err = fx.ingestor().ingest("UCabc", "vid1").await.unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(IngestError::ReferentialInconsistency { .. })
        ));
        assert!(fx.stub.calls()?.is_empty());
        assert_eq!(fx.catalog.writes.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn extraction_failure_leaves_nothing_behind() -> Result<()> {
        let fx = fixture(StubScript::new().failing_video("vid1")).await?;
        let err = fx.ingestor().ingest("UCabc", "vid1").await.unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(IngestError::ExternalTool { .. })
        ));
        assert!(!fx.video_dir("vid1").exists());
        assert!(find_stale_staging(fx.root.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn subtitle_language_is_last_segment() {
        assert_eq!(subtitle_language("video.en.vtt"), Some("en"));
        assert_eq!(subtitle_language("video.en-GB.vtt"), Some("en-GB"));
        assert_eq!(subtitle_language("video.vtt"), None);
        assert_eq!(subtitle_language("video.en.srt"), None);
    }

    #[test]
    fn upload_timestamp_prefers_explicit_values() {
        let info = |json: &str| -> VideoInfo { serde_json::from_str(json).unwrap() };
        assert_eq!(
            upload_timestamp("v", &info(r#"{"timestamp": 5, "release_timestamp": 6}"#)),
            5
        );
        assert_eq!(
            upload_timestamp("v", &info(r#"{"release_timestamp": 6, "upload_date": "20240101"}"#)),
            6
        );
        assert_eq!(
            upload_timestamp("v", &info(r#"{"upload_date": "20240101"}"#)),
            1_704_067_200
        );
        assert_eq!(upload_timestamp("v", &info(r#"{"upload_date": "2024-01-01"}"#)), 0);
    }
}
