//! Upload stage: move a run's local files into the input bucket.
//!
//! The stage creates the run's directory marker first, then uploads every
//! file concurrently and waits for all of them. Its result is a
//! [`StagedInputs`] value that the batch stage consumes; no flag outside the
//! run records whether anything was uploaded.

use crate::config::{RelayConfig, UploadFailurePolicy};
use crate::error::RelayError;
use crate::run::RunLayout;
use crate::storage::{self, ObjectStore, UploadOutcome};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::path::PathBuf;
use tracing::{info, warn};

/// A file received from the client and written to the run's upload dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Client-supplied name, reduced to its last path component.
    pub name: String,
    pub size: u64,
    /// Local copy, `<upload_dir>/<run>-<name>`.
    pub path: PathBuf,
}

impl UploadedFile {
    /// Name of the local copy, also used as the remote object name.
    pub fn stored_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Why a file did not make it into the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
    MarkerName,
    UploadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub name: String,
    pub reason: SkipReason,
}

/// Result of the upload stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedInputs {
    /// Keys in the input bucket, in submission order.
    pub keys: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

impl StagedInputs {
    /// Number of files that reached the object store.
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Upload every file of a run to the input bucket.
///
/// Fails if the directory marker cannot be written. A failed file upload
/// fails the stage under [`UploadFailurePolicy::Abort`] and is recorded as
/// skipped under [`UploadFailurePolicy::Proceed`].
pub async fn stage_inputs(
    store: &dyn ObjectStore,
    config: &RelayConfig,
    layout: &RunLayout,
    files: &[UploadedFile],
) -> Result<StagedInputs, RelayError> {
    let bucket = config.input_bucket.name().to_string();
    storage::create_directory_marker(store, &bucket, &layout.input_prefix).await?;

    let max_bytes = config.max_file_bytes;
    let uploads: Vec<BoxFuture<'_, Result<UploadOutcome, RelayError>>> = files
        .iter()
        .map(|file| {
            let key = layout.input_key(&file.stored_name());
            let bucket = bucket.clone();
            let marker = layout.input_prefix.clone();
            let path = file.path.clone();
            let size = file.size;
            async move {
                storage::upload_object(store, &bucket, &path, size, &key, &marker, max_bytes).await
            }
            .boxed()
        })
        .collect();

    let mut staged = StagedInputs::default();
    let mut first_failure: Option<RelayError> = None;

    for (file, outcome) in files.iter().zip(join_all(uploads).await) {
        let reason = match outcome {
            Ok(UploadOutcome::Uploaded { key }) => {
                staged.keys.push(key);
                continue;
            }
            Ok(UploadOutcome::SkippedTooLarge { size, limit }) => SkipReason::TooLarge { size, limit },
            Ok(UploadOutcome::SkippedMarker) => SkipReason::MarkerName,
            Err(e) => {
                warn!(run = %layout.run, file = %file.name, "Upload failed: {}", e);
                let reason = SkipReason::UploadFailed(e.to_string());
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
                reason
            }
        };
        staged.skipped.push(SkippedFile {
            name: file.name.clone(),
            reason,
        });
    }

    if let Some(err) = first_failure {
        if config.upload_failure_policy == UploadFailurePolicy::Abort {
            return Err(err);
        }
    }

    info!(
        run = %layout.run,
        "Staged {}/{} files ({} skipped)",
        staged.count(),
        files.len(),
        staged.skipped.len()
    );
    Ok(staged)
}
