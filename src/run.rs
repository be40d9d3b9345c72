//! Run identifiers and the paths derived from them.
//!
//! Every submission gets its own [`RunId`]. All local directories and remote
//! keys of that submission hang off the id, so concurrent runs never touch
//! each other's files. The id travels explicitly through the call chain;
//! nothing in the crate holds a "current run".

use crate::config::RelayConfig;
use crate::error::RelayError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Opaque token naming one processing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    /// Mint a fresh, random run id.
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for RunId {
    type Err = RelayError;

    /// Only canonical UUIDs are accepted, which also keeps client-supplied
    /// tokens from escaping the data directory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|_| RelayError::UnknownRun(s.to_string()))
    }
}

/// Local directories and remote prefixes owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run: RunId,
    /// `<data_dir>/uploads/<run>`
    pub upload_dir: PathBuf,
    /// `<data_dir>/processed/<run>`
    pub processed_dir: PathBuf,
    /// Key prefix in the input bucket, ending in `/`. Also the key of the
    /// directory marker object.
    pub input_prefix: String,
    /// Key prefix in the output bucket, ending in `/`.
    pub output_prefix: String,
}

impl RunLayout {
    pub fn new(config: &RelayConfig, run: RunId) -> Self {
        let output_prefix = if config.output_prefix.is_empty() {
            format!("{run}/")
        } else {
            format!("{}/{run}/", config.output_prefix)
        };
        Self {
            run,
            upload_dir: config.uploads_root().join(run.to_string()),
            processed_dir: config.processed_root().join(run.to_string()),
            input_prefix: format!("{run}/"),
            output_prefix,
        }
    }

    /// Local file name for an uploaded file: `<run>-<name>`.
    pub fn local_upload_name(&self, client_name: &str) -> String {
        format!("{}-{}", self.run, client_name)
    }

    /// Remote key for a file staged under the input prefix.
    pub fn input_key(&self, file_name: &str) -> String {
        format!("{}{}", self.input_prefix, file_name)
    }
}

/// Reduce a client-supplied file name to its last path component.
///
/// Returns `None` for names that have no usable component (`""`, `..`, `/`).
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Path::new(last)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
