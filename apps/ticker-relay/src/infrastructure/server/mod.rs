//! HTTP Server
//!
//! One listener serving the health routes and the relay socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::health::{HealthServerState, health_router};
use crate::infrastructure::relay::{SharedRelayHub, relay_router};

/// Health, metrics and relay HTTP server.
#[derive(Debug)]
pub struct RelayServer {
    port: u16,
    health: Arc<HealthServerState>,
    hub: SharedRelayHub,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(
        port: u16,
        health: Arc<HealthServerState>,
        hub: SharedRelayHub,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            health,
            hub,
            cancel,
        }
    }

    /// Combined router.
    pub fn router(&self) -> Router {
        health_router(Arc::clone(&self.health)).merge(relay_router(Arc::clone(&self.hub)))
    }

    /// Bind `0.0.0.0:port` and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), RelayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError::ServerFailed` if the server stops with an error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayServerError> {
        let app = self.router();
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, "Relay server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| RelayServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
