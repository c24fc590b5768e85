//! Application Services
//!
//! - `EventBus`: synchronous fan-out of client events to registered observers

mod event_bus;

pub use event_bus::{EventBus, ObserverId};
