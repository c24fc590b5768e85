//! Domain Layer - Connection lifecycle and event types.
//!
//! Pure types with no I/O: the connection state machine, the events the
//! exchange client publishes, and topic naming.

/// Connection state machine.
pub mod connection;

/// Lifecycle and market events.
pub mod events;

/// Exchange topic names.
pub mod topic;
