//! Bearer tokens for Google Cloud REST APIs.
//!
//! Two sources are supported:
//!
//! * a static token handed in through configuration (`GOOGLE_ACCESS_TOKEN`),
//!   handy for local runs with `gcloud auth print-access-token`;
//! * the GCE / Cloud Run metadata server, which serves short-lived tokens
//!   for the attached service account. Tokens are cached until one minute
//!   before expiry.

use crate::error::RelayError;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the server-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum Source {
    Static(String),
    Metadata {
        http: reqwest::Client,
        url: String,
        cache: Mutex<Option<CachedToken>>,
    },
}

/// Supplies `Authorization: Bearer` values to the Google API clients.
pub struct TokenSource {
    source: Source,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Static(_) => "static",
            Source::Metadata { .. } => "metadata",
        };
        f.debug_struct("TokenSource").field("kind", &kind).finish()
    }
}

impl TokenSource {
    /// Always return `token`.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: Source::Static(token.into()),
        }
    }

    /// Fetch tokens from the instance metadata server.
    pub fn metadata_server(http: reqwest::Client) -> Self {
        Self::metadata_server_at(http, METADATA_TOKEN_URL)
    }

    /// Like [`TokenSource::metadata_server`] with a custom URL.
    pub fn metadata_server_at(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            source: Source::Metadata {
                http,
                url: url.into(),
                cache: Mutex::new(None),
            },
        }
    }

    /// Static token when one is configured, metadata server otherwise.
    pub fn from_config(token: Option<&str>, http: reqwest::Client) -> Self {
        match token {
            Some(t) if !t.is_empty() => Self::fixed(t),
            _ => Self::metadata_server(http),
        }
    }

    /// A currently valid access token.
    pub async fn token(&self) -> Result<String, RelayError> {
        match &self.source {
            Source::Static(t) => Ok(t.clone()),
            Source::Metadata { http, url, cache } => {
                let mut guard = cache.lock().await;
                if let Some(cached) = guard.as_ref() {
                    if Instant::now() < cached.refresh_at {
                        return Ok(cached.value.clone());
                    }
                }
                let fresh = fetch_metadata_token(http, url).await?;
                let value = fresh.value.clone();
                *guard = Some(fresh);
                Ok(value)
            }
        }
    }
}

async fn fetch_metadata_token(http: &reqwest::Client, url: &str) -> Result<CachedToken, RelayError> {
    let response = http
        .get(url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| RelayError::storage("authenticate", e))?;

    if !response.status().is_success() {
        return Err(RelayError::storage(
            "authenticate",
            format!("metadata server returned HTTP {}", response.status()),
        ));
    }

    let token: MetadataToken = response
        .json()
        .await
        .map_err(|e| RelayError::storage("authenticate", e))?;
    debug!("Fetched access token valid for {}s", token.expires_in);

    let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
    Ok(CachedToken {
        value: token.access_token,
        refresh_at: Instant::now() + lifetime,
    })
}
