//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the HTTP
//! surface and process-level concerns.

/// KuCoin WebSocket client adapter.
pub mod kucoin;

/// Downstream relay socket and prices room.
pub mod relay;

/// Configuration from the environment.
pub mod config;

/// Health check endpoints and downstream probe.
pub mod health;

/// HTTP server hosting health routes and the relay socket.
pub mod server;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
