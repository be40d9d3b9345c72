//! Batch stage: submit one processor job per run and wait for it.
//!
//! The wait blocks only the calling task. Remote operations have no
//! cancellation path here; once submitted the relay can only wait, bounded
//! by `processing_timeout_secs`.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pipeline::upload::StagedInputs;
use crate::processor::{BatchJobRequest, DocumentProcessor, InputDocument, OperationStatus};
use crate::run::RunLayout;
use crate::storage::PDF_MIME_TYPE;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Build the job descriptor for a run, or `None` when nothing was staged.
pub fn build_request(
    config: &RelayConfig,
    layout: &RunLayout,
    staged: &StagedInputs,
) -> Option<BatchJobRequest> {
    if staged.is_empty() {
        return None;
    }
    let documents = staged
        .keys
        .iter()
        .map(|key| InputDocument {
            uri: config.input_bucket.object_uri(key),
            mime_type: PDF_MIME_TYPE.to_string(),
        })
        .collect();
    Some(BatchJobRequest {
        processor: config.processor.resource_name(),
        documents,
        output_uri: config.output_bucket.object_uri(&layout.output_prefix),
    })
}

/// Submit `request` and poll until the operation finishes.
///
/// Returns [`RelayError::Processing`] when submission fails or the operation
/// ends in failure, and [`RelayError::Timeout`] when it is still running
/// after `timeout`.
pub async fn submit_and_wait(
    processor: &dyn DocumentProcessor,
    request: &BatchJobRequest,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), RelayError> {
    let started = Instant::now();
    let operation = processor.submit(request).await.map_err(as_processing)?;
    info!(
        "Processing {} documents (operation {})",
        request.documents.len(),
        operation.name
    );

    let wait = async {
        loop {
            let status = match processor.poll(&operation).await {
                Ok(status) => status,
                Err(e) => return Err(as_processing(e)),
            };
            match status {
                OperationStatus::Succeeded => return Ok(()),
                OperationStatus::Failed { message } => {
                    return Err(RelayError::Processing(message));
                }
                OperationStatus::Running => {
                    debug!("Operation {} still running", operation.name);
                    sleep(poll_interval).await;
                }
            }
        }
    };

    let remaining = timeout.saturating_sub(started.elapsed());
    match tokio::time::timeout(remaining, wait).await {
        Ok(result) => {
            if result.is_ok() {
                info!(
                    "Operation {} finished in {}ms",
                    operation.name,
                    started.elapsed().as_millis()
                );
            }
            result
        }
        Err(_) => Err(RelayError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// Processor-side failures surface as processing errors whatever their origin.
fn as_processing(e: RelayError) -> RelayError {
    match e {
        RelayError::Processing(_) | RelayError::Timeout { .. } => e,
        other => RelayError::Processing(other.to_string()),
    }
}
