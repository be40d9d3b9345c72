//! Error types for the invoice-relay library.
//!
//! A single enum, [`RelayError`], covers every way a run can fail. Variants
//! map onto HTTP status codes through [`RelayError::status`] so the server
//! layer never has to inspect error text.
//!
//! Two conditions are deliberately *not* errors:
//!
//! * a file above the size limit, which is skipped and reported in
//!   [`crate::pipeline::upload::StagedInputs::skipped`];
//! * a failed deletion during cleanup, which is logged and swallowed.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the invoice-relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Gate errors ───────────────────────────────────────────────────────
    /// Missing `X-API-KEY` header, or the key is not in the configured set.
    #[error("Unauthorized")]
    Unauthorized,

    /// The client address exhausted its request quota for the current window.
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Request errors ────────────────────────────────────────────────────
    /// The multipart body could not be accepted (too many files, bad field).
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// The run token supplied by the client is malformed.
    #[error("Unknown run '{0}'")]
    UnknownRun(String),

    // ── Remote errors ─────────────────────────────────────────────────────
    /// An object store operation failed.
    #[error("Storage {op} failed: {detail}")]
    Storage { op: &'static str, detail: String },

    /// The document processor rejected the batch or finished with an error.
    #[error("Document processing failed: {0}")]
    Processing(String),

    /// The batch job did not finish within the configured bound.
    #[error("Document processing timed out after {secs}s")]
    Timeout { secs: u64 },

    // ── Local errors ──────────────────────────────────────────────────────
    /// A local read, write, or directory operation failed.
    #[error("Filesystem error on '{path}': {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required setting is absent or invalid. Fatal at startup.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Shorthand for a [`RelayError::Storage`] built from any displayable cause.
    pub fn storage(op: &'static str, detail: impl std::fmt::Display) -> Self {
        RelayError::Storage {
            op,
            detail: detail.to_string(),
        }
    }

    /// Shorthand for a [`RelayError::Filesystem`] error.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelayError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            RelayError::Unauthorized => 401,
            RelayError::RateLimited { .. } => 429,
            RelayError::InvalidUpload(_) | RelayError::UnknownRun(_) => 400,
            RelayError::Storage { .. }
            | RelayError::Processing(_)
            | RelayError::Timeout { .. }
            | RelayError::Filesystem { .. }
            | RelayError::Configuration(_) => 500,
        }
    }

    /// Message safe to show to the caller.
    ///
    /// Server-side failures collapse to one generic sentence; paths, bucket
    /// names and upstream messages stay in the log.
    pub fn public_message(&self) -> String {
        match self.status() {
            500 => "Error processing documents".to_string(),
            _ => self.to_string(),
        }
    }
}
