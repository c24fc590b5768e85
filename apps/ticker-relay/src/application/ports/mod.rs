//! Port Interfaces
//!
//! Contracts between the connection core and its adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TokenProvider`: bullet handshake returning a [`ConnectionToken`]
//!
//! ## Driver Ports (Inbound)
//!
//! - `ConnectionStatus`: exchange socket state read by health checks
//! - `LivenessProbe`: downstream relay liveness read by health checks

use async_trait::async_trait;

use crate::domain::connection::ConnectionToken;

/// Failure to obtain a connection token.
///
/// Fatal for the current attempt only; the reconnect policy retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Transport-level failure reaching the endpoint.
    #[error("handshake request failed: {0}")]
    Network(String),

    /// Endpoint answered with a non-success status.
    #[error("handshake rejected with HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Response body could not be decoded.
    #[error("invalid handshake response: {0}")]
    InvalidResponse(String),

    /// Response carried no usable token.
    #[error("invalid token from exchange")]
    MissingToken,

    /// Response listed no instance servers.
    #[error("no instance servers in handshake response")]
    NoInstanceServers,

    /// Request signing failed.
    #[error("failed to sign handshake request: {0}")]
    Signing(String),
}

/// Obtains a fresh connection token for each connect attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a token and endpoint.
    async fn fetch_token(&self) -> Result<ConnectionToken, HandshakeError>;

    /// Whether tokens are for the private channel.
    fn is_private(&self) -> bool;
}

/// Read-only view of the exchange connection.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionStatus: Send + Sync {
    /// Whether the exchange socket is open and welcomed.
    fn is_socket_open(&self) -> bool;
}

/// Liveness of a downstream dependency.
#[cfg_attr(test, mockall::automock)]
pub trait LivenessProbe: Send + Sync {
    /// Synchronous health predicate.
    fn is_healthy(&self) -> bool;
}
