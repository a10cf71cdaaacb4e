//! Error types for the blitzdl engine

use blitzdl_types::DownloadId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the download engine and catalog.
#[derive(Debug, Error)]
pub enum BlitzError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server reported a content length of zero.
    #[error("content length is invalid")]
    InvalidContentLength,

    /// The server did not report a content length; unknown-size downloads
    /// are not supported.
    #[error("unknown content length is not supported")]
    UnknownContentLength,

    /// The resolved media type cannot be downloaded (HTML/CSS pages).
    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),

    #[error("download not found: {0}")]
    DownloadNotFound(DownloadId),

    /// The ledger references a scratch file that is no longer on disk.
    #[error("scratch file missing: {0}")]
    ScratchMissing(PathBuf),

    /// All segments terminated but the byte count does not add up.
    #[error("download incomplete: read {read} of {expected} bytes")]
    Incomplete { expected: i64, read: i64 },

    #[error("download was cancelled")]
    Cancelled,
}

impl BlitzError {
    /// Whether this error came from the download being stopped rather than
    /// from a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlitzError::Cancelled)
    }
}
