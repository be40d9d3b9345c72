//! Configuration types for the relay.
//!
//! All behaviour is controlled through [`RelayConfig`], built via its
//! [`RelayConfigBuilder`]. The binary maps environment variables onto the
//! builder; library users and tests set fields directly.
//!
//! Every remote identifier (buckets, processor) is required. [`RelayConfigBuilder::build`]
//! rejects an incomplete configuration with [`RelayError::Configuration`] so
//! the process fails at startup instead of on the first request.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default per-file limit for remote upload: 10 MiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Configuration for the relay server and its pipeline.
///
/// # Example
/// ```rust
/// use invoice_relay::RelayConfig;
///
/// let config = RelayConfig::builder()
///     .project_id("acme-invoices")
///     .location("eu")
///     .processor_id("4af1c2d3e4f5")
///     .input_bucket("gs://acme-invoice-input")
///     .output_bucket("gs://acme-invoice-output")
///     .output_prefix("results")
///     .api_keys("key-one,key-two")
///     .allowed_origin("https://app.acme.test")
///     .build()
///     .unwrap();
/// assert_eq!(config.api_keys.len(), 2);
/// ```
#[derive(Clone)]
pub struct RelayConfig {
    /// Host part of the listen address. Default: `0.0.0.0`.
    pub bind_addr: String,

    /// Listen port. Default: 8080.
    pub port: u16,

    /// Single origin allowed to call the API from a browser.
    pub allowed_origin: String,

    /// Document AI processor that runs the batch jobs.
    pub processor: ProcessorName,

    /// Bucket receiving the uploaded PDFs.
    pub input_bucket: BucketUri,

    /// Bucket the processor writes its results into.
    pub output_bucket: BucketUri,

    /// Path prefix inside the output bucket. Each run writes below
    /// `<output_prefix>/<run>/`.
    pub output_prefix: String,

    /// Accepted values of the `X-API-KEY` header. Immutable once built.
    pub api_keys: Vec<String>,

    /// Root under which `uploads/` and `processed/` are created. Default: `.`.
    pub data_dir: PathBuf,

    /// Files above this size are kept out of the batch. Default: 10 MiB.
    pub max_file_bytes: u64,

    /// Maximum number of files per submission. Default: 10.
    pub max_files: usize,

    /// Requests allowed per client address per window. Default: 15.
    pub rate_limit: usize,

    /// Length of the rate-limit window in seconds. Default: 3600.
    pub rate_window_secs: u64,

    /// Delay between two polls of the batch operation. Default: 5000 ms.
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for one batch operation. Default: 900 s.
    ///
    /// Document AI operations have no client-side deadline of their own; a
    /// stuck operation would otherwise hold the request open forever.
    pub processing_timeout_secs: u64,

    /// What to do when one file fails to upload. Default: [`UploadFailurePolicy::Abort`].
    pub upload_failure_policy: UploadFailurePolicy,

    /// Static bearer token for Google APIs. When `None`, tokens are fetched
    /// from the GCE metadata server.
    pub access_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origin: String::new(),
            processor: ProcessorName::default(),
            input_bucket: BucketUri::default(),
            output_bucket: BucketUri::default(),
            output_prefix: String::new(),
            api_keys: Vec::new(),
            data_dir: PathBuf::from("."),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_files: 10,
            rate_limit: 15,
            rate_window_secs: 3600,
            poll_interval_ms: 5000,
            processing_timeout_secs: 900,
            upload_failure_policy: UploadFailurePolicy::default(),
            access_token: None,
        }
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("allowed_origin", &self.allowed_origin)
            .field("processor", &self.processor)
            .field("input_bucket", &self.input_bucket)
            .field("output_bucket", &self.output_bucket)
            .field("output_prefix", &self.output_prefix)
            .field("api_keys", &format_args!("<{} keys>", self.api_keys.len()))
            .field("data_dir", &self.data_dir)
            .field("max_file_bytes", &self.max_file_bytes)
            .field("max_files", &self.max_files)
            .field("rate_limit", &self.rate_limit)
            .field("rate_window_secs", &self.rate_window_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("processing_timeout_secs", &self.processing_timeout_secs)
            .field("upload_failure_policy", &self.upload_failure_policy)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RelayConfig {
    /// Create a new builder for `RelayConfig`.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding the raw multipart uploads of every run.
    pub fn uploads_root(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Directory holding the downloaded results of every run.
    pub fn processed_root(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    /// Largest request body the server accepts.
    ///
    /// Oversize files must still arrive in full so they can be skipped
    /// instead of failing the whole request. One extra MiB covers the
    /// multipart framing.
    pub fn max_request_bytes(&self) -> usize {
        let per_file = self.max_file_bytes.saturating_mul(2);
        let total = per_file
            .saturating_mul(self.max_files as u64)
            .saturating_add(MULTIPART_OVERHEAD_BYTES);
        total.min(usize::MAX as u64) as usize
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.allowed_origin = origin.into();
        self
    }

    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.config.processor.project = id.into();
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.config.processor.location = location.into();
        self
    }

    pub fn processor_id(mut self, id: impl Into<String>) -> Self {
        self.config.processor.processor_id = id.into();
        self
    }

    pub fn input_bucket(mut self, uri: impl AsRef<str>) -> Self {
        self.config.input_bucket = BucketUri::parse(uri.as_ref());
        self
    }

    pub fn output_bucket(mut self, uri: impl AsRef<str>) -> Self {
        self.config.output_bucket = BucketUri::parse(uri.as_ref());
        self
    }

    pub fn output_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.config.output_prefix = prefix.as_ref().trim_matches('/').to_string();
        self
    }

    /// Set the accepted API keys from a comma-separated list.
    pub fn api_keys(mut self, csv: impl AsRef<str>) -> Self {
        self.config.api_keys = parse_key_list(csv.as_ref());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn max_file_bytes(mut self, n: u64) -> Self {
        self.config.max_file_bytes = n;
        self
    }

    pub fn max_files(mut self, n: usize) -> Self {
        self.config.max_files = n.max(1);
        self
    }

    pub fn rate_limit(mut self, n: usize) -> Self {
        self.config.rate_limit = n;
        self
    }

    pub fn rate_window_secs(mut self, secs: u64) -> Self {
        self.config.rate_window_secs = secs.max(1);
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn processing_timeout_secs(mut self, secs: u64) -> Self {
        self.config.processing_timeout_secs = secs;
        self
    }

    pub fn upload_failure_policy(mut self, policy: UploadFailurePolicy) -> Self {
        self.config.upload_failure_policy = policy;
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.config.access_token = (!token.is_empty()).then_some(token);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RelayConfig, RelayError> {
        let c = &self.config;
        let required = [
            ("GOOGLE_PROJECT_ID", c.processor.project.as_str()),
            ("GOOGLE_PROJECT_LOCATION", c.processor.location.as_str()),
            ("GOOGLE_DOCUMENT_PROCESSOR_ID", c.processor.processor_id.as_str()),
            ("GCS_INPUT_BUCKET_URI", c.input_bucket.name()),
            ("GCS_OUTPUT_BUCKET_URI", c.output_bucket.name()),
            ("GCS_OUTPUT_BUCKET_PREFIX", c.output_prefix.as_str()),
            ("REACT_APP_URL", c.allowed_origin.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(RelayError::Configuration(format!("{name} must be set")));
            }
        }
        if c.api_keys.is_empty() {
            return Err(RelayError::Configuration(
                "VALID_KEYS must contain at least one key".into(),
            ));
        }
        if c.rate_limit == 0 {
            return Err(RelayError::Configuration(
                "Rate limit must be ≥ 1".into(),
            ));
        }
        if c.processing_timeout_secs == 0 {
            return Err(RelayError::Configuration(
                "Processing timeout must be ≥ 1s".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Split a comma-separated key list, dropping blanks and surrounding spaces.
pub fn parse_key_list(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Remote identifiers ───────────────────────────────────────────────────

/// A bucket, accepted either as `gs://name` or as a bare name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketUri(String);

impl BucketUri {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let name = trimmed.strip_prefix("gs://").unwrap_or(trimmed);
        BucketUri(name.trim_end_matches('/').to_string())
    }

    /// Bare bucket name, as used by the storage JSON API.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// `gs://` URI of an object key inside this bucket.
    pub fn object_uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.0, key.trim_start_matches('/'))
    }
}

impl fmt::Display for BucketUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}", self.0)
    }
}

/// Fully-qualified Document AI processor identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorName {
    pub project: String,
    pub location: String,
    pub processor_id: String,
}

impl ProcessorName {
    /// `projects/<project>/locations/<location>/processors/<id>`
    pub fn resource_name(&self) -> String {
        format!(
            "projects/{}/locations/{}/processors/{}",
            self.project, self.location, self.processor_id
        )
    }

    /// Regional REST endpoint serving this processor.
    pub fn endpoint(&self) -> String {
        format!("https://{}-documentai.googleapis.com/v1", self.location)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How a submission reacts when one file fails to reach the object store.
///
/// Oversize files are never failures; they are skipped under both policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadFailurePolicy {
    /// The whole submission fails with a storage error. (default)
    #[default]
    Abort,
    /// The failure is logged and the batch runs on the files that made it.
    Proceed,
}

impl FromStr for UploadFailurePolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(UploadFailurePolicy::Abort),
            "proceed" => Ok(UploadFailurePolicy::Proceed),
            other => Err(RelayError::Configuration(format!(
                "unknown upload failure policy '{other}' (expected abort or proceed)"
            ))),
        }
    }
}
