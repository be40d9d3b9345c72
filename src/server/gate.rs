//! Request gate: API key check and per-address rate limiting.
//!
//! Both checks run before any handler logic. The key check comes first so
//! that an unauthenticated caller always sees `401`, whatever its quota.

use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Header carrying the client's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Fixed set of accepted API keys.
#[derive(Debug, Clone)]
pub struct ApiKeys(HashSet<String>);

impl ApiKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ApiKeys(keys.into_iter().map(Into::into).collect())
    }

    pub fn check(&self, presented: Option<&str>) -> Result<(), RelayError> {
        match presented {
            Some(key) if self.0.contains(key) => Ok(()),
            _ => Err(RelayError::Unauthorized),
        }
    }
}

/// Record a hit if `entries` still has room in the window ending at `now`.
///
/// Prunes timestamps older than the window first. Returns `false` when the
/// request must be refused.
pub fn check_rate_limit(entries: &mut Vec<Instant>, now: Instant, max: usize, window: Duration) -> bool {
    entries.retain(|t| now.saturating_duration_since(*t) < window);
    if entries.len() >= max {
        return false;
    }
    entries.push(now);
    true
}

/// Sliding-window request counter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, ip: IpAddr, now: Instant) -> Result<(), RelayError> {
        let mut hits = self.hits.lock().await;
        // Keep the map from growing without bound under many distinct clients.
        if hits.len() > 1000 {
            let window = self.window;
            hits.retain(|_, entries| {
                entries.retain(|t| now.saturating_duration_since(*t) < window);
                !entries.is_empty()
            });
        }
        let entries = hits.entry(ip).or_default();
        if check_rate_limit(entries, now, self.max, self.window) {
            return Ok(());
        }
        let retry_after = entries
            .first()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window);
        Err(RelayError::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        })
    }
}

/// Middleware guarding every processing endpoint.
pub async fn request_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.keys.check(key) {
        warn!(client = %addr.ip(), path = %request.uri().path(), "Rejected request without valid API key");
        return Err(e);
    }
    if let Err(e) = state.limiter.check(addr.ip(), Instant::now()).await {
        warn!(client = %addr.ip(), path = %request.uri().path(), "Rate limit exceeded");
        return Err(e);
    }
    Ok(next.run(request).await)
}
