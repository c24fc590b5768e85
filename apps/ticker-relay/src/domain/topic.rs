//! Exchange topic names.

use std::fmt;

/// Topic carrying tickers for every listed symbol.
pub const ALL_TICKERS_TOPIC: &str = "/market/ticker:all";

/// A subscribable exchange topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    private_channel: bool,
}

impl Topic {
    /// Public topic.
    #[must_use]
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private_channel: false,
        }
    }

    /// Topic framed for the private channel.
    #[must_use]
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private_channel: true,
        }
    }

    /// Topic name as sent on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether control frames carry `privateChannel: true`.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.private_channel
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
