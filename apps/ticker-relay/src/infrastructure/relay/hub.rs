//! Prices room fan-out.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::protocol::{Envelope, UPDATE_PRICES};
use crate::domain::events::TickerEvent;
use crate::infrastructure::metrics;

/// Shared handle to the hub.
pub type SharedRelayHub = Arc<RelayHub>;

/// Broadcast channel behind the prices room.
///
/// Members hold a receiver; a member that falls more than the channel
/// capacity behind skips the missed updates.
#[derive(Debug)]
pub struct RelayHub {
    prices_tx: broadcast::Sender<Arc<str>>,
}

impl RelayHub {
    /// Create a hub whose room buffers `capacity` updates per member.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (prices_tx, _) = broadcast::channel(capacity.max(1));
        Self { prices_tx }
    }

    /// Join the prices room.
    #[must_use]
    pub fn join(&self) -> broadcast::Receiver<Arc<str>> {
        let rx = self.prices_tx.subscribe();
        metrics::set_relay_members(self.member_count());
        rx
    }

    /// Record that a member left. The receiver must already be dropped.
    pub fn left(&self) {
        metrics::set_relay_members(self.member_count());
    }

    /// Current room size.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.prices_tx.receiver_count()
    }

    /// Publish one price update. Returns the number of members reached.
    pub fn publish(&self, ticker: &TickerEvent) -> usize {
        let envelope = Envelope::new(UPDATE_PRICES, ticker.to_wire().to_string());
        let reached = self.prices_tx.send(Arc::from(envelope.to_text())).unwrap_or(0);
        if reached > 0 {
            metrics::record_ticker_relayed();
        }
        reached
    }
}
