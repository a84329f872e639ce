#![forbid(unsafe_code)]

//! Test doubles shared by the component tests.
//!
//! The `yt-dlp` stand-in is a generated bash script: it records every
//! invocation, prints a canned upload listing, writes a canned channel info
//! document, and fakes a video download into its working directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::ytdlp::video_url;

#[derive(Debug, Clone)]
pub struct StubScript {
    /// URLs printed by a listing, in playlist order.
    pub listing: Vec<String>,
    pub channel_info: String,
    /// Channel id written into downloaded info documents.
    pub video_channel_id: String,
    /// Additional files a download leaves behind.
    pub extra_download_files: Vec<String>,
    /// Video whose download exits nonzero.
    pub failing_video: Option<String>,
    /// Every invocation exits nonzero with this stderr.
    pub failure: Option<String>,
}

impl StubScript {
    pub fn new() -> Self {
        Self {
            listing: Vec::new(),
            channel_info: r#"{"id": "UCabc", "channel": "Abc Channel", "uploader_id": "@abc", "thumbnails": []}"#
                .to_string(),
            video_channel_id: "UCabc".to_string(),
            extra_download_files: Vec::new(),
            failing_video: None,
            failure: None,
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            failure: Some(stderr.to_string()),
            ..Self::new()
        }
    }

    pub fn with_listing(video_ids: &[&str]) -> Self {
        Self {
            listing: video_ids.iter().map(|id| video_url(id)).collect(),
            ..Self::new()
        }
    }

    pub fn push_raw_url(mut self, url: &str) -> Self {
        self.listing.push(url.to_string());
        self
    }

    pub fn channel_info(mut self, info: serde_json::Value) -> Self {
        self.channel_info = info.to_string();
        self
    }

    pub fn extra_download_file(mut self, name: &str) -> Self {
        self.extra_download_files.push(name.to_string());
        self
    }

    pub fn failing_video(mut self, video_id: &str) -> Self {
        self.failing_video = Some(video_id.to_string());
        self
    }

    fn render(&self, log_path: &Path) -> String {
        let mut script = String::from("#!/usr/bin/env bash\nset -eu\n");
        script.push_str(&format!(
            "printf '%s\\n' \"$*\" >> {}\n",
            shell_quote(&log_path.display().to_string())
        ));
        if let Some(stderr) = &self.failure {
            script.push_str(&format!("echo {} >&2\nexit 1\n", shell_quote(stderr)));
        }

        script.push_str(
            r#"mode=download
items=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --version) echo "2024.01.01-stub"; exit 0 ;;
    --skip-download) mode=channel ;;
    --flat-playlist) mode=list ;;
    --playlist-items) shift; items="$1" ;;
    --output|--cookies|--sub-langs|--sub-format|--format|--merge-output-format|--print) shift ;;
    *) url="$1" ;;
  esac
  shift
done
"#,
        );

        let urls = self
            .listing
            .iter()
            .map(|url| shell_quote(url))
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!(
            r#"if [[ "$mode" == list ]]; then
  urls=({urls})
  start=1
  end=${{#urls[@]}}
  if [[ -n "$items" ]]; then
    start="${{items%%:*}}"
    end="${{items##*:}}"
  fi
  for ((i = start; i <= end && i <= ${{#urls[@]}}; i++)); do
    printf '%s\n' "${{urls[i-1]}}"
  done
  exit 0
fi
"#
        ));

        script.push_str(&format!(
            "if [[ \"$mode\" == channel ]]; then\n  printf '%s' {} > channel.info.json\n  exit 0\nfi\n",
            shell_quote(&self.channel_info)
        ));

        script.push_str("vid=\"${url##*v=}\"\n");
        if let Some(failing) = &self.failing_video {
            script.push_str(&format!(
                "if [[ \"$vid\" == {} ]]; then\n  echo \"ERROR: [youtube] $vid: Video unavailable\" >&2\n  exit 1\nfi\n",
                shell_quote(failing)
            ));
        }
        script.push_str(&format!(
            r#"cat > video.info.json <<JSON
{{"id": "$vid", "channel_id": "{channel}", "title": "Title $vid", "description": "About $vid", "duration": 61.4, "upload_date": "20240102"}}
JSON
printf 'media' > video.mp4
printf 'thumb' > video.webp
printf 'WEBVTT' > video.en.vtt
"#,
            channel = self.video_channel_id
        ));
        for name in &self.extra_download_files {
            script.push_str(&format!("printf 'extra' > {}\n", shell_quote(name)));
        }
        script.push_str("exit 0\n");
        script
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug)]
pub struct InstalledStub {
    pub program: PathBuf,
    log_path: PathBuf,
}

impl InstalledStub {
    /// Argument lines of every invocation so far, oldest first.
    pub fn calls(&self) -> Result<Vec<String>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(&self.log_path)?
            .lines()
            .map(str::to_owned)
            .collect())
    }

    pub fn calls_matching(&self, needle: &str) -> Result<Vec<String>> {
        Ok(self
            .calls()?
            .into_iter()
            .filter(|call| call.contains(needle))
            .collect())
    }
}

pub fn install_stub(dir: &Path, script: &StubScript) -> Result<InstalledStub> {
    let program = dir.join("yt-dlp");
    let log_path = dir.join("yt-dlp.calls");
    fs::write(&program, script.render(&log_path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&program)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&program, perms)?;
    }
    Ok(InstalledStub { program, log_path })
}
