#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Ticker Relay - Exchange Ticker Fan-out
//!
//! Keeps one resilient connection to KuCoin's WebSocket market feed and
//! re-broadcasts normalized price updates to local WebSocket subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Connection state machine, events, topics
//!
//! - **Application**: Ports and the event bus
//!   - `ports`: Token handshake, connection status, liveness probe
//!   - `services`: Synchronous observer fan-out
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kucoin`: Bullet handshake and the supervised exchange socket
//!   - `relay`: Prices room and the downstream relay socket
//!   - `health`: Health endpoints and the downstream probe
//!   - `server`: HTTP listener
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//! KuCoin WS ──► Dispatcher ──► EventBus ──► RelayGateway ──► RelayHub ──► /ws members
//!                                  │
//!                                  └──► lifecycle logging
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Connection state and event types with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, ConnectionToken};
pub use domain::events::{ClientEvent, EventPayload, MarketTicker, TickerEvent};
pub use domain::topic::Topic;

// Application
pub use application::ports::{ConnectionStatus, HandshakeError, LivenessProbe, TokenProvider};
pub use application::services::{EventBus, ObserverId};

// Infrastructure config
pub use infrastructure::config::{
    BulletVersion, ConfigError, Credentials, Environment, ExchangeSettings, ProbeSettings,
    RelayConfig, RelaySettings, ServerSettings, WebSocketSettings,
};

// Exchange client
pub use infrastructure::kucoin::{BulletClient, ClientError, ClientSettings, KucoinWsClient};

// Relay
pub use infrastructure::relay::{Envelope, RelayGateway, RelayHub, SharedRelayHub};

// Health and server
pub use infrastructure::health::{DownstreamHealthService, HealthServerState, ProbeError};
pub use infrastructure::server::{RelayServer, RelayServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
