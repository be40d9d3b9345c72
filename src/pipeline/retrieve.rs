//! Retrieval stage: pull a finished job's output into the run's processed dir.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::run::RunLayout;
use crate::storage::{self, ObjectStore, RemoteObject};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Parallel downloads per run.
const DOWNLOAD_CONCURRENCY: usize = 8;

/// One downloaded result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// Absolute local path.
    pub path: String,
}

/// List the run's output prefix and download every object.
///
/// The manifest follows listing order even though downloads overlap. An
/// empty listing yields an empty manifest.
pub async fn stage_results(
    store: &dyn ObjectStore,
    config: &RelayConfig,
    layout: &RunLayout,
) -> Result<Vec<ManifestEntry>, RelayError> {
    let bucket = config.output_bucket.name();
    let objects: Vec<_> = storage::list_objects(store, bucket, &layout.output_prefix)
        .await?
        .into_iter()
        .filter(|o| !o.is_directory_marker())
        .collect();

    tokio::fs::create_dir_all(&layout.processed_dir)
        .await
        .map_err(|e| RelayError::fs(&layout.processed_dir, e))?;
    let processed_dir = tokio::fs::canonicalize(&layout.processed_dir)
        .await
        .map_err(|e| RelayError::fs(&layout.processed_dir, e))?;

    info!(run = %layout.run, "Fetching {} result objects", objects.len());

    let names = local_names(&objects, &layout.output_prefix);
    let downloads: Vec<BoxFuture<'_, Result<ManifestEntry, RelayError>>> = objects
        .into_iter()
        .zip(names)
        .map(|(object, name)| {
            let dest = processed_dir.join(&name);
            async move {
                storage::download_object(store, &object, &dest).await?;
                Ok::<_, RelayError>(ManifestEntry {
                    name,
                    path: dest.to_string_lossy().into_owned(),
                })
            }
            .boxed()
        })
        .collect();

    let manifest: Vec<ManifestEntry> = stream::iter(downloads)
        .buffered(DOWNLOAD_CONCURRENCY)
        .try_collect()
        .await?;

    info!(run = %layout.run, "Document processing complete: {} files", manifest.len());
    Ok(manifest)
}

/// Local file name for each listed object.
///
/// The basename is used when it is unique within the listing. Objects that
/// share a basename (same file in different shard directories) are named
/// after their key below `output_prefix` with `/` replaced by `_`.
fn local_names(objects: &[RemoteObject], output_prefix: &str) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for object in objects {
        *seen.entry(object.basename()).or_default() += 1;
    }
    objects
        .iter()
        .map(|object| {
            if seen.get(object.basename()).copied().unwrap_or(0) > 1 {
                object
                    .key
                    .strip_prefix(output_prefix)
                    .unwrap_or(&object.key)
                    .trim_start_matches('/')
                    .replace('/', "_")
            } else {
                object.basename().to_string()
            }
        })
        .collect()
}
