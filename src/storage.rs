//! Object store gateway.
//!
//! The relay only needs four capabilities from blob storage: write an object,
//! list by prefix, read an object, delete an object. [`ObjectStore`] captures
//! exactly those; [`crate::gcs::GcsObjectStore`] implements them against
//! Google Cloud Storage and [`MemoryObjectStore`] keeps everything in process
//! for local development and tests.
//!
//! The free functions below add the relay's own rules on top of the raw
//! trait: directory markers, the upload size limit, and parent-directory
//! creation on download.

use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Content type GCS consoles use for "folder" placeholder objects.
pub const DIRECTORY_MARKER_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// MIME type of every document the relay submits.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// An object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

impl RemoteObject {
    /// Last path segment of the key (`a/b/c-0.json` → `c-0.json`).
    pub fn basename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Marker objects end in `/` and carry no content.
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Minimal blob storage capability used by the relay.
///
/// Implementations must be safe to call concurrently for distinct keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` at `key`, replacing any existing object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), RelayError>;

    /// All objects whose key starts with `prefix`, in lexicographic key order.
    async fn list_objects(&self, bucket: &str, prefix: &str)
        -> Result<Vec<RemoteObject>, RelayError>;

    /// Full content of an object.
    async fn get_object(&self, object: &RemoteObject) -> Result<Bytes, RelayError>;

    /// Remove an object. Deleting a missing object is not an error.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), RelayError>;

    /// Copy an object to a local file. The parent directory must exist.
    ///
    /// The default buffers the object in memory; backends with a streaming
    /// transport override it.
    async fn download_to(&self, object: &RemoteObject, dest: &Path) -> Result<(), RelayError> {
        let data = self.get_object(object).await?;
        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| RelayError::fs(dest, e))
    }
}

// ── Gateway operations ───────────────────────────────────────────────────

/// Outcome of [`upload_object`] for one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file now lives at this key.
    Uploaded { key: String },
    /// The file exceeded the size limit and was left out.
    SkippedTooLarge { size: u64, limit: u64 },
    /// The file name collides with the run's directory marker.
    SkippedMarker,
}

/// Create the empty marker object that stands for a logical directory.
///
/// Writing an empty object is idempotent, so concurrent callers cannot
/// corrupt it. Failure aborts the run.
pub async fn create_directory_marker(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<(), RelayError> {
    let key = if key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    };
    store
        .put_object(bucket, &key, Bytes::new(), DIRECTORY_MARKER_CONTENT_TYPE)
        .await
        .inspect_err(|e| warn!("Error creating bucket directory {}: {}", key, e))?;
    info!("Bucket directory {} created", key);
    Ok(())
}

/// Upload one local PDF to `remote_key`, honouring the skip rules.
///
/// Files larger than `max_bytes` and files whose key equals `marker_key` are
/// skipped with a log line; only a failed write is an error.
pub async fn upload_object(
    store: &dyn ObjectStore,
    bucket: &str,
    local_path: &Path,
    size: u64,
    remote_key: &str,
    marker_key: &str,
    max_bytes: u64,
) -> Result<UploadOutcome, RelayError> {
    if size > max_bytes {
        warn!(
            "{} is {} bytes. Max file size {}; skipping",
            remote_key, size, max_bytes
        );
        return Ok(UploadOutcome::SkippedTooLarge {
            size,
            limit: max_bytes,
        });
    }
    if remote_key.trim_end_matches('/') == marker_key.trim_end_matches('/') {
        debug!("Not uploading directory marker {} as content", remote_key);
        return Ok(UploadOutcome::SkippedMarker);
    }

    let body = tokio::fs::read(local_path)
        .await
        .map_err(|e| RelayError::fs(local_path, e))?;
    store
        .put_object(bucket, remote_key, Bytes::from(body), PDF_MIME_TYPE)
        .await
        .inspect_err(|e| warn!("Error uploading file {} to {}: {}", remote_key, bucket, e))?;
    info!("{} uploaded to gs://{}", remote_key, bucket);
    Ok(UploadOutcome::Uploaded {
        key: remote_key.to_string(),
    })
}

/// List every object under `prefix`.
pub async fn list_objects(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<RemoteObject>, RelayError> {
    let objects = store.list_objects(bucket, prefix).await?;
    debug!("Listed {} objects under gs://{}/{}", objects.len(), bucket, prefix);
    Ok(objects)
}

/// Download one object to `dest`, creating parent directories as needed.
pub async fn download_object(
    store: &dyn ObjectStore,
    object: &RemoteObject,
    dest: &Path,
) -> Result<(), RelayError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RelayError::fs(parent, e))?;
    }
    store.download_to(object, dest).await?;
    debug!("Downloaded gs://{}/{} to {}", object.bucket, object.key, dest.display());
    Ok(())
}

// ── In-memory backend ────────────────────────────────────────────────────

/// Process-local object store.
///
/// Used for local development and by the test suite.
/// Writes or deletes whose key contains a registered "poison" substring fail,
/// which lets callers exercise storage error paths.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    poisoned: Mutex<Vec<String>>,
    undeletable: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_object` whose key contains `needle` fail.
    pub fn fail_puts_containing(&self, needle: impl Into<String>) {
        lock(&self.poisoned).push(needle.into());
    }

    /// Make every subsequent `delete_object` whose key contains `needle` fail.
    pub fn fail_deletes_containing(&self, needle: impl Into<String>) {
        lock(&self.undeletable).push(needle.into());
    }

    /// Keys currently stored in `bucket`.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Insert an object directly, bypassing poison rules.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), body.into());
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<(), RelayError> {
        if lock(&self.poisoned).iter().any(|n| key.contains(n.as_str())) {
            return Err(RelayError::storage("upload", format!("write to {key} refused")));
        }
        self.insert(bucket, key, body);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteObject>, RelayError> {
        Ok(lock(&self.objects)
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((b, k), v)| RemoteObject {
                bucket: b.clone(),
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    async fn get_object(&self, object: &RemoteObject) -> Result<Bytes, RelayError> {
        lock(&self.objects)
            .get(&(object.bucket.clone(), object.key.clone()))
            .cloned()
            .ok_or_else(|| RelayError::storage("download", format!("{} not found", object.key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), RelayError> {
        if lock(&self.undeletable).iter().any(|n| key.contains(n.as_str())) {
            return Err(RelayError::storage("delete", format!("delete of {key} refused")));
        }
        lock(&self.objects).remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
