//! Application Layer - Ports and services.
//!
//! Port traits decouple the exchange client and health endpoints from
//! their concrete adapters; services hold the in-process event bus.

/// Port interfaces for external systems (token handshake, status probes).
pub mod ports;

/// Application services (event bus).
pub mod services;
