#![forbid(unsafe_code)]

//! Failure kinds the ingestion pipeline distinguishes.
//!
//! Functions still return `anyhow::Result` so context can be layered on top;
//! callers that care about the kind use `err.downcast_ref::<IngestError>()`.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{program} exited with {status}: {stderr}")]
    ExternalTool {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("staged download for {video_id} is malformed: {reason}")]
    IntegrityViolation { video_id: String, reason: String },

    #[error("inconsistent permanent storage at {}: {reason}", path.display())]
    ReferentialInconsistency { path: PathBuf, reason: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("subscription state is inconsistent: {0}")]
    Consistency(String),

    #[error("could not extract a video id from {0:?}")]
    UnparsableVideoUrl(String),

    #[error("{}", stale_staging_message(.0))]
    StaleStaging(Vec<PathBuf>),

    #[error("media root {} is not a directory", .0.display())]
    InvalidMediaRoot(PathBuf),
}

fn stale_staging_message(paths: &[PathBuf]) -> String {
    let noun = if paths.len() == 1 {
        "directory"
    } else {
        "directories"
    };
    let listed = paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "found {} leftover staging {noun} from an unclean shutdown: {listed}; \
         remove them manually or pass --clean-stale-staging",
        paths.len()
    )
}

/// Returns the typed kind carried by an `anyhow` error, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&IngestError> {
    err.downcast_ref::<IngestError>()
}
