//! Readiness flag and the health HTTP server
//!
//! Routes:
//! - `GET /healthz` - liveness, always `ok`
//! - `GET /readyz` - `ok` once a sync has succeeded, 503 before that
//! - `GET /version` - build version and commit as JSON
//! - `GET /metrics` - Prometheus text exposition of the process metrics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;

/// One-way readiness signal shared between the reconciler and the server.
///
/// Starts not ready. [`mark_ready`](Readiness::mark_ready) flips it once and
/// nothing flips it back: a past successful sync is taken as proof that the
/// configuration works, even if later cycles fail.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Create a flag in the not-ready state
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process ready. Idempotent.
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a sync has succeeded yet
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Build identity reported by `/version`
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BuildInfo {
    /// Crate version
    pub version: String,
    /// Git commit the binary was built from
    pub commit: String,
}

impl BuildInfo {
    /// Identity of the running binary
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("CONSUL_SYNC_GIT_COMMIT")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

#[derive(Clone)]
struct HealthState {
    readiness: Readiness,
    build: Arc<BuildInfo>,
    registry: Registry,
}

/// Build the health router; `/metrics` serves whatever `registry` gathers
pub fn health_routes(readiness: Readiness, build: BuildInfo, registry: Registry) -> Router {
    let state = HealthState {
        readiness,
        build: Arc::new(build),
        registry,
    };
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(scrape))
        .with_state(state)
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn version(State(state): State<HealthState>) -> Json<BuildInfo> {
    Json(state.build.as_ref().clone())
}

async fn scrape(State(state): State<HealthState>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut body) {
        warn!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
        .into_response()
}

/// Serve health endpoints until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    readiness: Readiness,
    build: BuildInfo,
    registry: Registry,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::internal_with_context("health", format!("failed to bind {addr}: {e}"))
    })?;
    info!(addr = %addr, "health server listening");

    axum::serve(listener, health_routes(readiness, build, registry))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::internal_with_context("health", format!("server error: {e}")))
}
