//! Health Check and Metrics Endpoints
//!
//! HTTP routes for liveness, exchange connection status and Prometheus
//! metrics. Used by container orchestrators, load balancers and monitoring.
//!
//! # Endpoints
//!
//! - `GET /health-check` - Process liveness (`{"status":"up"}`)
//! - `GET /health-check/ws` - Exchange socket and relay probe status
//! - `GET /health` - Detailed JSON status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /metrics` - Prometheus metrics in text format

mod probe;

use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use probe::{DownstreamHealthService, ProbeError, ProbeSnapshot};

use crate::application::ports::{ConnectionStatus, LivenessProbe};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::relay::SharedRelayHub;

// =============================================================================
// Health Response Types
// =============================================================================

/// Up/down status body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is serving.
    Up,
    /// Component is not serving.
    Down,
}

/// `{"status": ...}` response.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusBody {
    /// Reported status.
    pub status: HealthStatus,
}

/// Detailed health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Combined status, same as `/health-check/ws`.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Exchange socket is open and welcomed.
    pub exchange_connected: bool,
    /// Relay probe result, `None` when the probe is disabled.
    pub relay_healthy: Option<bool>,
    /// Members of the prices room.
    pub relay_members: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health routes.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    exchange: Arc<dyn ConnectionStatus>,
    probe: Option<Arc<dyn LivenessProbe>>,
    hub: SharedRelayHub,
}

impl std::fmt::Debug for HealthServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServerState")
            .field("version", &self.version)
            .field("probe_enabled", &self.probe.is_some())
            .finish_non_exhaustive()
    }
}

impl HealthServerState {
    /// Create health state. A `None` probe leaves `/health-check/ws` to the
    /// exchange socket alone.
    #[must_use]
    pub fn new(
        version: String,
        exchange: Arc<dyn ConnectionStatus>,
        probe: Option<Arc<dyn LivenessProbe>>,
        hub: SharedRelayHub,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            exchange,
            probe,
            hub,
        }
    }

    fn relay_healthy(&self) -> Option<bool> {
        self.probe.as_ref().map(|probe| probe.is_healthy())
    }

    fn status(&self) -> HealthStatus {
        if self.exchange.is_socket_open() && self.relay_healthy().unwrap_or(true) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    }
}

/// Health and metrics routes.
pub fn health_router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health-check", get(liveness_status_handler))
        .route("/health-check/ws", get(socket_status_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn liveness_status_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(StatusBody { status: HealthStatus::Up }))
}

async fn socket_status_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let status = state.status();
    if status == HealthStatus::Down {
        tracing::warn!(
            exchange = state.exchange.is_socket_open(),
            relay = ?state.relay_healthy(),
            "Socket health check failed"
        );
    }
    (status_code(status), Json(StatusBody { status }))
}

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    (status_code(response.status), Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

const fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Up => StatusCode::OK,
        HealthStatus::Down => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    HealthResponse {
        status: state.status(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        exchange_connected: state.exchange.is_socket_open(),
        relay_healthy: state.relay_healthy(),
        relay_members: state.hub.member_count(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use test_case::test_case;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{MockConnectionStatus, MockLivenessProbe};
    use crate::infrastructure::relay::RelayHub;

    fn state(socket_open: bool, probe: Option<bool>) -> Arc<HealthServerState> {
        let mut exchange = MockConnectionStatus::new();
        exchange.expect_is_socket_open().return_const(socket_open);
        let probe = probe.map(|healthy| {
            let mut mock = MockLivenessProbe::new();
            mock.expect_is_healthy().return_const(healthy);
            Arc::new(mock) as Arc<dyn LivenessProbe>
        });
        Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            Arc::new(exchange),
            probe,
            Arc::new(RelayHub::new(4)),
        ))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, Value) {
        let response = health_router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[test_case(true, Some(true), StatusCode::OK, "up" ; "socket open and relay healthy")]
    #[test_case(true, None, StatusCode::OK, "up" ; "socket open without probe")]
    #[test_case(false, Some(true), StatusCode::INTERNAL_SERVER_ERROR, "down" ; "socket closed")]
    #[test_case(true, Some(false), StatusCode::INTERNAL_SERVER_ERROR, "down" ; "relay unhealthy")]
    #[tokio::test]
    async fn socket_health_check(open: bool, probe: Option<bool>, code: StatusCode, status: &str) {
        let (got, body) = get(state(open, probe), "/health-check/ws").await;
        assert_eq!(got, code);
        assert_eq!(body, json!({ "status": status }));
    }

    #[tokio::test]
    async fn liveness_is_up_while_socket_is_down() {
        let (got, body) = get(state(false, Some(false)), "/health-check").await;
        assert_eq!(got, StatusCode::OK);
        assert_eq!(body, json!({ "status": "up" }));
    }

    #[tokio::test]
    async fn detailed_health_reports_components() {
        let (got, body) = get(state(true, None), "/health").await;
        assert_eq!(got, StatusCode::OK);
        assert_eq!(body["status"], "up");
        assert_eq!(body["exchange_connected"], true);
        assert_eq!(body["relay_healthy"], Value::Null);
        assert_eq!(body["relay_members"], 0);
    }

    #[test]
    fn status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Up).unwrap(), "\"up\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Down).unwrap(), "\"down\"");
    }
}
