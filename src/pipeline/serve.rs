//! Serve stage: hand staged results to the client, then drop the run's files.
//!
//! A run moves through two states:
//!
//! ```text
//! Staged ──(client fetch)──▶ Cleaned
//! ```
//!
//! Reading a missing or empty processed dir is not an error: it is what a
//! `Cleaned` run looks like, so a repeated fetch yields an empty list.
//! Cleanup is best effort. Every deletion is attempted, failures are logged
//! and counted, nothing is propagated.

use crate::error::RelayError;
use crate::run::RunLayout;
use crate::storage::{ObjectStore, RemoteObject};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A result file returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub name: String,
    pub data: String,
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

impl CleanupReport {
    fn merge(self, other: CleanupReport) -> CleanupReport {
        CleanupReport {
            removed: self.removed + other.removed,
            failed: self.failed + other.failed,
        }
    }
}

/// Regular files directly inside `dir`, sorted by name.
/// A missing directory has no files.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, RelayError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RelayError::fs(dir, e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| RelayError::fs(dir, e))? {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Read every staged result of a run as text.
pub async fn read_processed(processed_dir: &Path) -> Result<Vec<ProcessedFile>, RelayError> {
    let paths = list_files(processed_dir).await?;
    let files = try_join_all(paths.into_iter().map(|path| async move {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RelayError::fs(&path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok::<_, RelayError>(ProcessedFile {
            name,
            data: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }))
    .await?;
    debug!("Read {} processed files from {}", files.len(), processed_dir.display());
    Ok(files)
}

/// Delete every file in `dir`, leaving the directory itself in place.
pub async fn clear_dir(dir: &Path) -> CleanupReport {
    let paths = match list_files(dir).await {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Cleanup could not list {}: {}", dir.display(), e);
            return CleanupReport {
                removed: 0,
                failed: 1,
            };
        }
    };
    let removals: Vec<BoxFuture<'static, (PathBuf, std::io::Result<()>)>> = paths
        .into_iter()
        .map(|path| {
            async move {
                let result = tokio::fs::remove_file(&path).await;
                (path, result)
            }
            .boxed()
        })
        .collect();
    let results = join_all(removals).await;

    let mut report = CleanupReport::default();
    for (path, result) in results {
        match result {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Cleanup failed to delete {}: {}", path.display(), e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Delete the run's input objects (marker and PDFs) from the input bucket.
pub async fn clear_remote_inputs(
    store: &dyn ObjectStore,
    bucket: &str,
    layout: &RunLayout,
) -> CleanupReport {
    let objects = match store.list_objects(bucket, &layout.input_prefix).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!(run = %layout.run, "Cleanup could not list remote inputs: {}", e);
            return CleanupReport {
                removed: 0,
                failed: 1,
            };
        }
    };
    let deletions: Vec<BoxFuture<'_, (RemoteObject, Result<(), RelayError>)>> = objects
        .into_iter()
        .map(|object| {
            async move {
                let result = store.delete_object(&object.bucket, &object.key).await;
                (object, result)
            }
            .boxed()
        })
        .collect();
    let results = join_all(deletions).await;

    let mut report = CleanupReport::default();
    for (object, result) in results {
        match result {
            Ok(()) => report.removed += 1,
            Err(e) => {
                warn!("Cleanup failed to delete gs://{}/{}: {}", object.bucket, object.key, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Remove all temporary state of a run: processed files, uploaded files,
/// and the remote input objects.
pub async fn cleanup_run(
    store: &dyn ObjectStore,
    input_bucket: &str,
    layout: &RunLayout,
) -> CleanupReport {
    info!(run = %layout.run, "Cleaning up...");
    let (processed, uploads, remote) = tokio::join!(
        clear_dir(&layout.processed_dir),
        clear_dir(&layout.upload_dir),
        clear_remote_inputs(store, input_bucket, layout),
    );
    let report = processed.merge(uploads).merge(remote);
    info!(
        run = %layout.run,
        "Clean up - done ({} removed, {} failed)",
        report.removed,
        report.failed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_files_sorted_by_name() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("b.json"), "B").await.unwrap();
        tokio::fs::write(dir.path().join("a.json"), "A").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let files = read_processed(dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![
                ProcessedFile { name: "a.json".into(), data: "A".into() },
                ProcessedFile { name: "b.json".into(), data: "B".into() },
            ]
        );
    }

    #[tokio::test]
    async fn missing_dir_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let files = read_processed(&dir.path().join("never-created")).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn clear_dir_keeps_directory() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("x"), "1").await.unwrap();
        tokio::fs::write(dir.path().join("y"), "2").await.unwrap();

        let report = clear_dir(dir.path()).await;
        assert_eq!(report, CleanupReport { removed: 2, failed: 0 });
        assert!(dir.path().exists());
        assert!(read_processed(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clearing_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let report = clear_dir(&dir.path().join("gone")).await;
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test]
    async fn invalid_utf8_is_read_lossily() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("bin"), [0x66, 0xff, 0x6f]).await.unwrap();
        let files = read_processed(dir.path()).await.unwrap();
        assert_eq!(files[0].data, "f\u{fffd}o");
    }

    #[tokio::test]
    async fn failed_remote_deletes_are_counted_not_raised() {
        use crate::config::RelayConfig;
        use crate::run::RunId;
        use crate::storage::MemoryObjectStore;

        let dir = TempDir::new().unwrap();
        let config = RelayConfig::builder()
            .data_dir(dir.path())
            .project_id("p")
            .location("us")
            .processor_id("x")
            .input_bucket("in")
            .output_bucket("out")
            .output_prefix("res")
            .api_keys("k")
            .allowed_origin("*")
            .build()
            .unwrap();
        let layout = RunLayout::new(&config, RunId::new());
        let store = MemoryObjectStore::new();
        store.insert("in", &layout.input_prefix, "");
        store.insert("in", &layout.input_key("a.pdf"), "%PDF");
        store.insert("in", &layout.input_key("locked.pdf"), "%PDF");
        store.fail_deletes_containing("locked");
        tokio::fs::create_dir_all(&layout.processed_dir).await.unwrap();
        tokio::fs::write(layout.processed_dir.join("a-0.json"), "{}").await.unwrap();

        let report = cleanup_run(&store, "in", &layout).await;

        assert_eq!(report, CleanupReport { removed: 3, failed: 1 });
        assert_eq!(store.keys("in"), vec![layout.input_key("locked.pdf")]);
        assert!(read_processed(&layout.processed_dir).await.unwrap().is_empty());
    }
}
