//! Configuration Module
//!
//! Environment-driven configuration for the relay.

mod settings;

pub use settings::{
    BulletVersion, ConfigError, Credentials, Environment, ExchangeSettings, ProbeSettings,
    RelayConfig, RelaySettings, ServerSettings, WebSocketSettings,
};
