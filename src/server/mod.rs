//! HTTP surface of the relay.
//!
//! ```text
//! POST /process-multiple   gate → multipart intake → Relay::process_batch
//! GET  /processed?run=<id> gate → Relay::take_processed
//! GET  /healthz            no gate
//! ```
//!
//! CORS sits outside everything else so browser preflights are answered
//! without an API key.

pub mod gate;
pub mod handlers;

use crate::error::RelayError;
use crate::relay::Relay;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gate::{ApiKeys, RateLimiter, API_KEY_HEADER};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Response header carrying the run token of a submission.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub keys: Arc<ApiKeys>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        let config = relay.config();
        let keys = ApiKeys::new(config.api_keys.iter().cloned());
        let limiter = RateLimiter::new(
            config.rate_limit,
            Duration::from_secs(config.rate_window_secs),
        );
        Self {
            relay,
            keys: Arc::new(keys),
            limiter: Arc::new(limiter),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody {
            message: self.public_message(),
        });
        match self {
            RelayError::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// Assemble the application router around `relay`.
///
/// Fails when the configured origin is not a valid header value.
pub fn build_router(relay: Arc<Relay>) -> Result<Router, RelayError> {
    let cors = cors_layer(&relay.config().allowed_origin)?;
    let body_limit = relay.config().max_request_bytes();
    let state = AppState::new(relay);

    let gated = Router::new()
        .route("/process-multiple", post(handlers::process_multiple))
        .route("/processed", get(handlers::processed))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gate::request_gate,
        ));

    Ok(Router::new()
        .merge(gated)
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(cors))
}

fn cors_layer(origin: &str) -> Result<CorsLayer, RelayError> {
    let allow_origin = if origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(origin.trim()).map_err(|e| {
            RelayError::Configuration(format!("REACT_APP_URL is not a valid origin: {e}"))
        })?;
        AllowOrigin::exact(value)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static(API_KEY_HEADER),
            header::ORIGIN,
            header::CONTENT_TYPE,
        ])
        .expose_headers([HeaderName::from_static(RUN_ID_HEADER)]))
}

/// Bind the configured address and serve until Ctrl-C or SIGTERM.
pub async fn serve(relay: Arc<Relay>) -> Result<(), RelayError> {
    let addr = format!("{}:{}", relay.config().bind_addr, relay.config().port);
    let app = build_router(relay)?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Configuration(format!("failed to bind {addr}: {e}")))?;
    info!("invoice-relay listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| RelayError::Configuration(format!("server error: {e}")))?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to capture Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to capture SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = sigterm => info!("Received SIGTERM, shutting down"),
    }
}
