//! Server binary for invoice-relay.
//!
//! A thin shim over the library crate that maps environment variables and
//! flags to `RelayConfig` and runs the HTTP server.

use anyhow::{Context, Result};
use clap::Parser;
use invoice_relay::{server, Relay, RelayConfig, UploadFailurePolicy};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Relay PDF invoices through Google Document AI.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-relay",
    version,
    about = "Relay PDF invoices through Google Document AI",
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Listen port.
    #[arg(long, env = "PORT")]
    port: u16,

    /// Listen host.
    #[arg(long, env = "RELAY_BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: String,

    /// Browser origin allowed by CORS ("*" for any).
    #[arg(long, env = "REACT_APP_URL")]
    allowed_origin: String,

    /// Google Cloud project of the processor.
    #[arg(long, env = "GOOGLE_PROJECT_ID")]
    project_id: String,

    /// Processor location, e.g. "us" or "eu".
    #[arg(long, env = "GOOGLE_PROJECT_LOCATION")]
    location: String,

    /// Document AI processor id.
    #[arg(long, env = "GOOGLE_DOCUMENT_PROCESSOR_ID")]
    processor_id: String,

    /// Bucket receiving uploaded PDFs (gs://name or name).
    #[arg(long, env = "GCS_INPUT_BUCKET_URI")]
    input_bucket: String,

    /// Bucket the processor writes results to.
    #[arg(long, env = "GCS_OUTPUT_BUCKET_URI")]
    output_bucket: String,

    /// Prefix inside the output bucket.
    #[arg(long, env = "GCS_OUTPUT_BUCKET_PREFIX")]
    output_prefix: String,

    /// Comma-separated list of accepted API keys.
    #[arg(long, env = "VALID_KEYS", hide_env_values = true)]
    valid_keys: String,

    /// Root of the uploads/ and processed/ directories.
    #[arg(long, env = "RELAY_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Files above this size (bytes) are skipped.
    #[arg(long, env = "RELAY_MAX_FILE_BYTES", default_value_t = invoice_relay::config::DEFAULT_MAX_FILE_BYTES)]
    max_file_bytes: u64,

    /// Maximum files per submission.
    #[arg(long, env = "RELAY_MAX_FILES", default_value_t = 10)]
    max_files: usize,

    /// Requests per client address per window.
    #[arg(long, env = "RELAY_RATE_LIMIT", default_value_t = 15)]
    rate_limit: usize,

    /// Rate-limit window in seconds.
    #[arg(long, env = "RELAY_RATE_WINDOW_SECS", default_value_t = 3600)]
    rate_window_secs: u64,

    /// Delay between two polls of a batch operation (ms).
    #[arg(long, env = "RELAY_POLL_INTERVAL_MS", default_value_t = 5000)]
    poll_interval_ms: u64,

    /// Give up waiting for a batch operation after this many seconds.
    #[arg(long, env = "RELAY_PROCESSING_TIMEOUT_SECS", default_value_t = 900)]
    processing_timeout_secs: u64,

    /// What to do when one file fails to upload: abort or proceed.
    #[arg(long, env = "RELAY_UPLOAD_FAILURE_POLICY", default_value = "abort")]
    upload_failure_policy: String,

    /// Static bearer token for Google APIs. Uses the metadata server when unset.
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Enable debug logging.
    #[arg(short, long, env = "RELAY_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let policy: UploadFailurePolicy = cli
        .upload_failure_policy
        .parse()
        .context("Invalid RELAY_UPLOAD_FAILURE_POLICY")?;

    let mut builder = RelayConfig::builder()
        .port(cli.port)
        .bind_addr(cli.bind_addr)
        .allowed_origin(cli.allowed_origin)
        .project_id(cli.project_id)
        .location(cli.location)
        .processor_id(cli.processor_id)
        .input_bucket(cli.input_bucket)
        .output_bucket(cli.output_bucket)
        .output_prefix(cli.output_prefix)
        .api_keys(cli.valid_keys)
        .data_dir(cli.data_dir)
        .max_file_bytes(cli.max_file_bytes)
        .max_files(cli.max_files)
        .rate_limit(cli.rate_limit)
        .rate_window_secs(cli.rate_window_secs)
        .poll_interval_ms(cli.poll_interval_ms)
        .processing_timeout_secs(cli.processing_timeout_secs)
        .upload_failure_policy(policy);
    if let Some(token) = cli.access_token {
        builder = builder.access_token(token);
    }
    let config = builder.build().context("Invalid configuration")?;

    info!(?config, "Starting invoice-relay");

    let relay = Relay::google(config).context("Failed to initialise Google clients")?;
    server::serve(Arc::new(relay))
        .await
        .context("Server terminated with an error")?;
    Ok(())
}
