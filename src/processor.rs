//! Remote document processor capability.
//!
//! A processor takes a batch of documents that already live in the object
//! store, works on them asynchronously, and writes its results under an
//! output prefix. The relay only needs to submit such a batch and then ask
//! whether it finished; [`DocumentProcessor`] is that contract.

use crate::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One input object reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDocument {
    /// `gs://bucket/key`
    pub uri: String,
    pub mime_type: String,
}

/// Everything needed to start one batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobRequest {
    /// `projects/<p>/locations/<l>/processors/<id>`
    pub processor: String,
    pub documents: Vec<InputDocument>,
    /// `gs://bucket/prefix/run/`
    pub output_uri: String,
}

/// Handle to a submitted long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
}

/// State of a long-running operation as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed { message: String },
}

/// Submit batch jobs and observe their completion.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Start a batch job. Returns as soon as the remote side accepted it.
    async fn submit(&self, request: &BatchJobRequest) -> Result<OperationHandle, RelayError>;

    /// Current state of a previously submitted job.
    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus, RelayError>;
}
