//! Relay envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Room joined by price subscribers.
pub const PRICES_ROOM: &str = "prices-room";

/// `subscribe` payload that joins [`PRICES_ROOM`].
pub const JOIN_PRICES_ROOM: &str = "ioToken.joinUpdatePrices";

/// Event name of price broadcasts.
pub const UPDATE_PRICES: &str = "update-prices";

/// One relay frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// `{"event":"subscribe","data":"ioToken.joinUpdatePrices"}`
    #[must_use]
    pub fn join_prices() -> Self {
        Self::new("subscribe", JOIN_PRICES_ROOM)
    }

    /// `{"event":"ping"}`
    #[must_use]
    pub fn ping() -> Self {
        Self::new("ping", Value::Null)
    }

    /// `{"event":"pong","data":"pong"}`
    #[must_use]
    pub fn pong() -> Self {
        Self::new("pong", "pong")
    }

    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not an envelope.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode for the socket.
    #[must_use]
    pub fn to_text(&self) -> String {
        // Envelopes are string keys over JSON values; encoding cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
