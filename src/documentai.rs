//! Google Document AI backend for [`DocumentProcessor`].
//!
//! `batchProcess` returns a long-running operation; completion is observed
//! by fetching the operation resource until `done` is set. A finished
//! operation can still carry a failure, either as a top-level `error` or as
//! a `FAILED`/`CANCELLED` state in its metadata.

use crate::auth::TokenSource;
use crate::config::ProcessorName;
use crate::error::RelayError;
use crate::processor::{BatchJobRequest, DocumentProcessor, OperationHandle, OperationStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchProcessBody<'a> {
    input_documents: InputConfig<'a>,
    document_output_config: OutputConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig<'a> {
    gcs_documents: GcsDocuments<'a>,
}

#[derive(Debug, Serialize)]
struct GcsDocuments<'a> {
    documents: Vec<GcsDocument<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GcsDocument<'a> {
    gcs_uri: &'a str,
    mime_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputConfig<'a> {
    gcs_output_config: GcsOutputConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GcsOutputConfig<'a> {
    gcs_uri: &'a str,
}

impl<'a> From<&'a BatchJobRequest> for BatchProcessBody<'a> {
    fn from(req: &'a BatchJobRequest) -> Self {
        Self {
            input_documents: InputConfig {
                gcs_documents: GcsDocuments {
                    documents: req
                        .documents
                        .iter()
                        .map(|d| GcsDocument {
                            gcs_uri: &d.uri,
                            mime_type: &d.mime_type,
                        })
                        .collect(),
                },
            },
            document_output_config: OutputConfig {
                gcs_output_config: GcsOutputConfig {
                    gcs_uri: &req.output_uri,
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<RpcStatus>,
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    state: Option<String>,
    state_message: Option<String>,
}

impl Operation {
    fn status(&self) -> OperationStatus {
        if !self.done {
            return OperationStatus::Running;
        }
        if let Some(ref err) = self.error {
            return OperationStatus::Failed {
                message: format!("code {}: {}", err.code, err.message),
            };
        }
        if let Some(ref meta) = self.metadata {
            if let Some(state @ ("FAILED" | "CANCELLED")) = meta.state.as_deref() {
                return OperationStatus::Failed {
                    message: meta
                        .state_message
                        .clone()
                        .unwrap_or_else(|| format!("operation {state}")),
                };
            }
        }
        OperationStatus::Succeeded
    }
}

// ── Client ───────────────────────────────────────────────────────────────

/// Document AI REST client bound to one regional endpoint.
#[derive(Debug, Clone)]
pub struct DocumentAiClient {
    http: reqwest::Client,
    tokens: Arc<TokenSource>,
    endpoint: String,
}

impl DocumentAiClient {
    /// Client for the regional endpoint serving `processor`.
    pub fn new(http: reqwest::Client, tokens: Arc<TokenSource>, processor: &ProcessorName) -> Self {
        Self::with_endpoint(http, tokens, processor.endpoint())
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<TokenSource>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn read_operation(response: reqwest::Response) -> Result<Operation, RelayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Processing(format!(
                "HTTP {status}: {}",
                body.trim()
            )));
        }
        response
            .json::<Operation>()
            .await
            .map_err(|e| RelayError::Processing(format!("malformed operation: {e}")))
    }
}

#[async_trait]
impl DocumentProcessor for DocumentAiClient {
    async fn submit(&self, request: &BatchJobRequest) -> Result<OperationHandle, RelayError> {
        let url = format!("{}/{}:batchProcess", self.endpoint, request.processor);
        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| RelayError::Processing(e.to_string()))?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&BatchProcessBody::from(request))
            .send()
            .await
            .map_err(|e| RelayError::Processing(e.to_string()))?;
        let operation = Self::read_operation(response).await?;
        debug!("Submitted batch operation {}", operation.name);
        Ok(OperationHandle {
            name: operation.name,
        })
    }

    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus, RelayError> {
        let url = format!("{}/{}", self.endpoint, operation.name);
        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| RelayError::Processing(e.to_string()))?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::Processing(e.to_string()))?;
        Ok(Self::read_operation(response).await?.status())
    }
}
