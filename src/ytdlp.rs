#![forbid(unsafe_code)]

//! Thin wrapper around the `yt-dlp` executable.
//!
//! Every invocation runs inside a caller-chosen working directory so outputs
//! land in a staging area, never directly in the archive. A nonzero exit is
//! turned into [`IngestError::ExternalTool`] carrying the tool's stderr.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::IngestError;

/// Output template shared by every download so staged files have stable stems.
const CHANNEL_OUTPUT: &str = "channel.%(ext)s";
const VIDEO_OUTPUT: &str = "video.%(ext)s";

pub fn channel_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{channel_id}")
}

pub fn channel_videos_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{channel_id}/videos")
}

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Inclusive, 1-based item range understood by `--playlist-items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemWindow {
    pub start: usize,
    pub end: usize,
}

impl ItemWindow {
    fn as_arg(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionTool {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl ExtractionTool {
    pub fn new(program: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies,
        }
    }

    /// Runs `<program> --version`, failing loudly when the tool is missing.
    pub async fn ensure_available(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("{} is not installed or not in PATH", self.program.display()))?;
        self.check_status(output).map(|_| ())
    }

    /// Writes the channel's info document (no video items) into `workdir`.
    pub async fn fetch_channel_info(&self, workdir: &Path, channel_id: &str) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--skip-download".into(),
            "--write-info-json".into(),
            "--playlist-items".into(),
            "0".into(),
            "--output".into(),
            CHANNEL_OUTPUT.into(),
            channel_url(channel_id).into(),
        ];
        self.run(workdir, args).await.map(|_| ())
    }

    /// Prints one video URL per line for a channel's upload list, optionally
    /// restricted to a window.
    pub async fn list_video_urls(
        &self,
        workdir: &Path,
        channel_id: &str,
        window: Option<ItemWindow>,
    ) -> Result<Vec<String>> {
        let mut args: Vec<OsString> = vec![
            "--flat-playlist".into(),
            "--print".into(),
            "url".into(),
        ];
        if let Some(window) = window {
            args.push("--playlist-items".into());
            args.push(window.as_arg().into());
        }
        args.push(channel_videos_url(channel_id).into());

        let output = self.run(workdir, args).await?;
        let stdout =
            String::from_utf8(output.stdout).context("playlist listing is not valid UTF-8")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Downloads info document, thumbnail, subtitles and the media stream of
    /// one video into `workdir`.
    pub async fn download_video(
        &self,
        workdir: &Path,
        video_id: &str,
        subtitle_langs: &str,
    ) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--no-overwrites".into(),
            "--write-info-json".into(),
            "--write-thumbnail".into(),
            "--write-subs".into(),
            "--write-auto-subs".into(),
            "--sub-langs".into(),
            subtitle_langs.into(),
            "--sub-format".into(),
            "vtt".into(),
            "--format".into(),
            "bv*+ba/b".into(),
            "--merge-output-format".into(),
            "mp4/webm".into(),
            "--output".into(),
            VIDEO_OUTPUT.into(),
            video_url(video_id).into(),
        ];
        self.run(workdir, args).await.map(|_| ())
    }

    async fn run(&self, workdir: &Path, args: Vec<OsString>) -> Result<Output> {
        let mut command = Command::new(&self.program);
        command
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command.args(&args);

        debug!("Executing {:?} in {}", command.as_std(), workdir.display());
        let output = command
            .output()
            .await
            .with_context(|| format!("running {}", self.program.display()))?;
        trace!(
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Command finished"
        );
        self.check_status(output)
    }

    fn check_status(&self, output: Output) -> Result<Output> {
        if output.status.success() {
            return Ok(output);
        }
        Err(IngestError::ExternalTool {
            program: self.program.display().to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into())
    }
}

/// Extracts the video id from a URL printed by a flat playlist listing.
pub fn video_id_from_url(url: &str) -> Result<String, IngestError> {
    let unparsable = || IngestError::UnparsableVideoUrl(url.to_string());
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);

    let candidate = if let Some((_, query)) = without_fragment.split_once('?')
        && let Some(value) = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("v="))
    {
        value
    } else {
        let path = without_fragment
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(unparsable)?;
        let path = path.split('?').next().unwrap_or(path);
        let mut segments = path.split('/').filter(|segment| !segment.is_empty());
        let host = segments.next().ok_or_else(unparsable)?;
        if host.ends_with("youtu.be") {
            segments.next().ok_or_else(unparsable)?
        } else {
            match (segments.next(), segments.next()) {
                (Some("shorts" | "live" | "embed"), Some(id)) => id,
                _ => return Err(unparsable()),
            }
        }
    };

    let valid = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(candidate.to_string())
    } else {
        Err(unparsable())
    }
}
