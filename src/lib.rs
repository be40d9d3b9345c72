//! # invoice-relay
//!
//! HTTP relay that sends PDF invoices through Google Document AI.
//!
//! A client uploads a batch of PDFs, the relay stages them in Cloud Storage,
//! runs one Document AI batch job over them, downloads the results and
//! returns a manifest. A second call hands back the result contents and
//! removes every temporary file of the run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! multipart upload
//!  │
//!  ├─ 0. Gate      API key + per-IP rate limit
//!  ├─ 1. Upload    marker object + concurrent PDF uploads (oversize → skipped)
//!  ├─ 2. Batch     one batchProcess operation, polled until done
//!  ├─ 3. Retrieve  list run output prefix, download into processed/<run>/
//!  └─ 4. Serve     GET /processed?run=… returns contents, then cleans up
//! ```
//!
//! Each submission is a run, identified by a [`RunId`]. Every local
//! directory and remote prefix is namespaced by it, so concurrent
//! submissions never see each other's files.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use invoice_relay::{server, Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::builder()
//!         .project_id("acme-invoices")
//!         .location("eu")
//!         .processor_id("4af1c2d3e4f5")
//!         .input_bucket("gs://acme-invoice-input")
//!         .output_bucket("gs://acme-invoice-output")
//!         .output_prefix("results")
//!         .api_keys("key-one")
//!         .allowed_origin("https://app.acme.test")
//!         .build()?;
//!     server::serve(Arc::new(Relay::google(config)?)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice-relay` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod auth;
pub mod config;
pub mod documentai;
pub mod error;
pub mod gcs;
pub mod pipeline;
pub mod processor;
pub mod relay;
pub mod run;
pub mod server;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BucketUri, ProcessorName, RelayConfig, RelayConfigBuilder, UploadFailurePolicy};
pub use error::RelayError;
pub use pipeline::retrieve::ManifestEntry;
pub use pipeline::serve::ProcessedFile;
pub use processor::{BatchJobRequest, DocumentProcessor, OperationHandle, OperationStatus};
pub use relay::Relay;
pub use run::{RunId, RunLayout};
pub use storage::{MemoryObjectStore, ObjectStore, RemoteObject};
