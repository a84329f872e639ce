#![forbid(unsafe_code)]

//! Staging directories and the moves out of them.
//!
//! Every download lands in a `.newtube-staging-*` directory directly under
//! the media root, so a commit is a same-filesystem rename in the common case.
//! A staging directory that outlives its process means an unclean shutdown.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::IngestError;

pub const STAGING_PREFIX: &str = ".newtube-staging-";

/// Creates a fresh staging directory; it is removed when the guard drops.
pub fn create_staging_dir(media_root: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(media_root)
        .with_context(|| format!("creating staging directory in {}", media_root.display()))?;
    debug!("Staging in {}", dir.path().display());
    Ok(dir)
}

pub fn find_stale_staging(media_root: &Path) -> Result<Vec<PathBuf>> {
    let mut stale = Vec::new();
    for entry in WalkDir::new(media_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry =
            entry.with_context(|| format!("scanning media root {}", media_root.display()))?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX))
        {
            stale.push(entry.into_path());
        }
    }
    Ok(stale)
}

/// Refuses to continue when leftovers exist, unless `auto_clean` is set, in
/// which case they are deleted.
pub fn check_stale_staging(media_root: &Path, auto_clean: bool) -> Result<()> {
    let stale = find_stale_staging(media_root)?;
    if stale.is_empty() {
        return Ok(());
    }
    if !auto_clean {
        return Err(IngestError::StaleStaging(stale).into());
    }

    for path in &stale {
        warn!("Removing leftover staging entry {}", path.display());
        let removed = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Renames `from` to `to`, copying and deleting when they sit on different
/// filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => copy_then_remove(from, to),
        Err(err) => Err(err)
            .with_context(|| format!("moving {} to {}", from.display(), to.display())),
    }
}

fn copy_then_remove(from: &Path, to: &Path) -> Result<()> {
    debug!(
        "Cross-device move of {}, falling back to copy",
        from.display()
    );
    fs::copy(from, to)
        .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("removing {}", from.display()))?;
    Ok(())
}
