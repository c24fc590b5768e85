//! Relay Gateway
//!
//! Downstream side of the relay: a WebSocket endpoint where consumers join
//! the prices room, and the gateway that turns exchange tickers into
//! `update-prices` broadcasts.
//!
//! # Wire format
//!
//! Every text frame is a JSON envelope `{"event": ..., "data": ...}`.
//!
//! | Direction | Event           | Data                                  |
//! |-----------|-----------------|---------------------------------------|
//! | in        | `subscribe`     | `"ioToken.joinUpdatePrices"`          |
//! | in        | `ping`          | ignored                               |
//! | out       | `pong`          | `"pong"`                              |
//! | out       | `update-prices` | JSON string of the price update       |
//! | out       | `error`         | reason                                |

mod gateway;
mod hub;
mod protocol;
mod socket;

pub use gateway::RelayGateway;
pub use hub::{RelayHub, SharedRelayHub};
pub use protocol::{Envelope, JOIN_PRICES_ROOM, PRICES_ROOM, UPDATE_PRICES};
pub use socket::relay_router;
