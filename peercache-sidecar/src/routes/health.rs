//! Health Check Endpoints
//!
//! Kubernetes-compatible probes plus the Prometheus scrape endpoint:
//! - /health/live - Process alive check
//! - /health/ready - Every sidecar component started
//! - /metrics - Prometheus text format

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use peercache_watch::EntryStore;
use serde::{Deserialize, Serialize};

use crate::peers::PeerStatus;
use crate::telemetry::SidecarMetrics;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Ready, but not connected to any peer.
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub version: String,
    pub uptime_seconds: u64,
    pub cache_entries: usize,
    pub connected_peers: usize,
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<EntryStore>,
    pub peers: Arc<dyn PeerStatus>,
    pub metrics: Arc<SidecarMetrics>,
    pub start_time: Instant,
    pub ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new(
        store: Arc<EntryStore>,
        peers: Arc<dyn PeerStatus>,
        metrics: Arc<SidecarMetrics>,
    ) -> Self {
        Self {
            store,
            peers,
            metrics,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag flipped by the supervisor once startup has finished.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/live
pub async fn liveness() -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Process is alive".to_string()),
        details: None,
    };
    (StatusCode::OK, Json(response))
}

/// GET /health/ready
pub async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let connected_peers = state.peers.connected_count();
    let details = HealthDetails {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        cache_entries: state.store.len(),
        connected_peers,
    };

    let (status_code, status, message) = if !state.ready.load(Ordering::Acquire) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthStatus::Unhealthy,
            Some("Sidecar is starting".to_string()),
        )
    } else if connected_peers == 0 {
        (
            StatusCode::OK,
            HealthStatus::Degraded,
            Some("No peers connected".to_string()),
        )
    } else {
        (StatusCode::OK, HealthStatus::Healthy, None)
    };

    let response = HealthResponse {
        status,
        message,
        details: Some(details),
    };
    (status_code, Json(response))
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the health and metrics router.
pub fn create_router(state: HealthState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}
