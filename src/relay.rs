//! End-to-end run orchestration.
//!
//! [`Relay`] owns the two remote capabilities and drives a run through the
//! pipeline stages:
//!
//! * [`Relay::process_batch`]: upload, submit, wait, download. Returns the
//!   manifest for the submission response.
//! * [`Relay::take_processed`]: read the staged results and schedule cleanup.
//!
//! A successful run keeps its temporary state until the client fetched the
//! results. A failed run has nothing to fetch, so its state is released
//! before the error is returned.

use crate::auth::TokenSource;
use crate::config::RelayConfig;
use crate::documentai::DocumentAiClient;
use crate::error::RelayError;
use crate::gcs::GcsObjectStore;
use crate::pipeline::retrieve::ManifestEntry;
use crate::pipeline::serve::ProcessedFile;
use crate::pipeline::upload::UploadedFile;
use crate::pipeline::{batch, retrieve, serve, upload};
use crate::processor::DocumentProcessor;
use crate::run::{RunId, RunLayout};
use crate::storage::ObjectStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Timeout for individual Google API calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared orchestrator; one instance serves every request.
pub struct Relay {
    config: Arc<RelayConfig>,
    store: Arc<dyn ObjectStore>,
    processor: Arc<dyn DocumentProcessor>,
    /// Runs whose results are being served or cleaned right now.
    serving: Mutex<HashSet<RunId>>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn ObjectStore>,
        processor: Arc<dyn DocumentProcessor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            processor,
            serving: Mutex::new(HashSet::new()),
        }
    }

    /// Relay backed by Cloud Storage and Document AI.
    pub fn google(config: RelayConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Configuration(format!("HTTP client: {e}")))?;
        let tokens = Arc::new(TokenSource::from_config(
            config.access_token.as_deref(),
            http.clone(),
        ));
        let store = Arc::new(GcsObjectStore::new(http.clone(), Arc::clone(&tokens)));
        let processor = Arc::new(DocumentAiClient::new(http, tokens, &config.processor));
        Ok(Self::new(config, store, processor))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Paths and prefixes of `run`.
    pub fn layout(&self, run: RunId) -> RunLayout {
        RunLayout::new(&self.config, run)
    }

    /// Run a submission through upload, processing and download.
    ///
    /// # Returns
    /// The manifest of downloaded result files, in listing order. Empty when
    /// no file could be staged (no job is submitted then) or when the job
    /// produced no output.
    ///
    /// On error the run's local and remote temporary state is removed
    /// before returning.
    ///
    /// # Errors
    /// - `Storage`: directory marker or (under the abort policy) a file upload failed
    /// - `Processing` / `Timeout`: the batch job failed or did not finish in time
    /// - `Filesystem`: the processed dir could not be written
    pub async fn process_batch(
        &self,
        layout: &RunLayout,
        files: &[UploadedFile],
    ) -> Result<Vec<ManifestEntry>, RelayError> {
        let started = Instant::now();
        info!(run = %layout.run, "Starting run with {} files", files.len());

        let result = self.run_stages(layout, files).await;
        match &result {
            Ok(manifest) => info!(
                run = %layout.run,
                "Run complete: {} result files in {}ms",
                manifest.len(),
                started.elapsed().as_millis()
            ),
            Err(e) => {
                error!(run = %layout.run, "Error processing documents: {}", e);
                serve::cleanup_run(self.store.as_ref(), self.config.input_bucket.name(), layout).await;
            }
        }
        result
    }

    async fn run_stages(
        &self,
        layout: &RunLayout,
        files: &[UploadedFile],
    ) -> Result<Vec<ManifestEntry>, RelayError> {
        // ── Step 1: Upload ───────────────────────────────────────────────────
        let staged = upload::stage_inputs(self.store.as_ref(), &self.config, layout, files).await?;

        // ── Step 2: Submit + await ───────────────────────────────────────────
        let Some(request) = batch::build_request(&self.config, layout, &staged) else {
            info!(run = %layout.run, "No files staged; skipping batch submission");
            return Ok(Vec::new());
        };
        batch::submit_and_wait(
            self.processor.as_ref(),
            &request,
            Duration::from_millis(self.config.poll_interval_ms),
            Duration::from_secs(self.config.processing_timeout_secs),
        )
        .await?;

        // ── Step 3: Download results ─────────────────────────────────────────
        retrieve::stage_results(self.store.as_ref(), &self.config, layout).await
    }

    /// Return a run's processed files and schedule removal of its state.
    ///
    /// Cleanup runs in a background task so it never delays or fails the
    /// response. While it is pending the run is marked busy and further
    /// fetches get an empty list, just as they do once it is done.
    pub async fn take_processed(self: &Arc<Self>, run: RunId) -> Result<Vec<ProcessedFile>, RelayError> {
        if !self.mark_serving(run) {
            info!(run = %run, "Run already being served; returning no files");
            return Ok(Vec::new());
        }

        let layout = self.layout(run);
        let files = match serve::read_processed(&layout.processed_dir).await {
            Ok(files) => files,
            Err(e) => {
                self.unmark_serving(run);
                return Err(e);
            }
        };
        info!(run = %run, "Downloading results - {} files", files.len());

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            serve::cleanup_run(relay.store.as_ref(), relay.config.input_bucket.name(), &layout).await;
            relay.unmark_serving(run);
        });

        Ok(files)
    }

    /// Returns `false` if `run` was already marked.
    fn mark_serving(&self, run: RunId) -> bool {
        self.serving
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(run)
    }

    fn unmark_serving(&self, run: RunId) {
        self.serving
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&run);
    }
}
