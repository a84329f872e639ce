#![forbid(unsafe_code)]

//! Process-level guard shared by the ingestion binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to run the archiver as root. Files created under the media root
/// must stay owned by the service account that later reads them.
pub fn ensure_not_root(process: &str) -> Result<()> {
    refuse_root_uid(Uid::effective(), process)
}

fn refuse_root_uid(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; run it as the account that owns the media root");
    }
    Ok(())
}
