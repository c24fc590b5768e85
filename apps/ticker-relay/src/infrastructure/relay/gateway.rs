//! Wiring between the exchange client and the prices room.

use std::sync::{Arc, Weak};

use super::hub::SharedRelayHub;
use crate::application::services::{EventBus, ObserverId};
use crate::domain::events::{ClientEvent, TickerEvent, names};
use crate::domain::topic::Topic;
use crate::infrastructure::kucoin::KucoinWsClient;

/// Observers that relay tickers and keep the ticker topic subscribed.
#[derive(Debug)]
pub struct RelayGateway {
    bus: Arc<EventBus>,
    observers: Vec<ObserverId>,
}

impl RelayGateway {
    /// Register the gateway's observers on `client`'s bus.
    ///
    /// Every `all-tickers` event is published to `hub`; every `ready`
    /// subscribes `topic` again.
    #[must_use]
    pub fn attach(
        client: &Arc<KucoinWsClient>,
        hub: SharedRelayHub,
        topic: Topic,
        exchange: impl Into<String>,
    ) -> Self {
        let bus = Arc::clone(client.bus());
        let exchange = exchange.into();
        let mut observers = Vec::new();

        observers.push(bus.on(names::ALL_TICKERS, move |event| {
            relay_ticker(&hub, event, &exchange);
        }));

        let weak: Weak<KucoinWsClient> = Arc::downgrade(client);
        observers.push(bus.on(names::READY, move |_| {
            if let Some(client) = weak.upgrade() {
                tracing::info!(topic = %topic, "KuCoin socket ready, subscribing");
                drop(client.subscribe_to(topic.clone()));
            }
        }));

        observers.push(bus.on_any(log_lifecycle));

        Self { bus, observers }
    }

    /// Remove the gateway's observers.
    pub fn detach(self) {
        for id in self.observers {
            self.bus.off(id);
        }
    }
}

fn relay_ticker(hub: &SharedRelayHub, event: &ClientEvent, exchange: &str) {
    let Some(ticker) = event.ticker() else {
        return;
    };
    match TickerEvent::from_ticker(ticker, exchange) {
        Some(update) => {
            hub.publish(&update);
        }
        None => tracing::debug!(pair = %ticker.pair(), "Ticker without price, not relayed"),
    }
}

fn log_lifecycle(event: &ClientEvent) {
    let name = event.event.as_str();
    match name {
        names::ERROR => tracing::error!(
            payload = ?event.message,
            cause = event.cause.as_deref().unwrap_or_default(),
            "Socket error occurred"
        ),
        names::CLOSE => tracing::warn!(payload = ?event.message, "Connection closed"),
        names::RECONNECT => tracing::warn!(payload = ?event.message, "Reconnecting socket"),
        names::RETRY_SUBSCRIPTION => tracing::warn!("Retrying subscription"),
        names::SOCKET_NOT_READY => tracing::debug!("Subscription waiting for socket"),
        names::SUBSCRIPTION => tracing::info!(payload = ?event.message, "Subscribed to the market ticker"),
        names::UNSUBSCRIPTION => {
            tracing::info!(payload = ?event.message, "Unsubscribed from the market ticker");
        }
        names::OPEN => tracing::debug!("KuCoin socket connected"),
        names::WELCOME => tracing::debug!("Received welcome message"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::MockTokenProvider;
    use crate::domain::events::{EventPayload, MarketTicker};
    use crate::infrastructure::kucoin::ClientSettings;
    use crate::infrastructure::relay::{Envelope, RelayHub};

    fn client(bus: Arc<EventBus>) -> Arc<KucoinWsClient> {
        let mut tokens = MockTokenProvider::new();
        tokens.expect_is_private().return_const(false);
        Arc::new(KucoinWsClient::new(
            Arc::new(tokens),
            bus,
            ClientSettings::default(),
            CancellationToken::new(),
        ))
    }

    fn all_tickers(data: serde_json::Value, base: &str, quote: &str) -> ClientEvent {
        ClientEvent::new(
            names::ALL_TICKERS,
            EventPayload::Ticker(MarketTicker::normalize(data, base, quote)),
        )
    }

    #[tokio::test]
    async fn all_tickers_are_published_to_room() {
        let bus = Arc::new(EventBus::new());
        let client = client(Arc::clone(&bus));
        let hub = Arc::new(RelayHub::new(8));
        let mut member = hub.join();
        let _gateway = RelayGateway::attach(
            &client,
            Arc::clone(&hub),
            Topic::public("/market/ticker:all"),
            "kucoin",
        );

        bus.emit(&all_tickers(json!({ "price": "50000" }), "BTC", "USDT"));
        bus.emit(&all_tickers(json!({}), "NO", "PRICE"));

        let text = tokio::time::timeout(Duration::from_secs(1), member.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::parse(&text).unwrap();
        assert_eq!(envelope.event, "update-prices");
        assert!(envelope.data.as_str().unwrap().contains("BTC-USDT"));
        assert!(member.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_removes_observers() {
        let bus = Arc::new(EventBus::new());
        let client = client(Arc::clone(&bus));
        let gateway = RelayGateway::attach(
            &client,
            Arc::new(RelayHub::new(8)),
            Topic::public("/market/ticker:all"),
            "kucoin",
        );
        assert_eq!(bus.observer_count(names::ALL_TICKERS), 1);
        gateway.detach();
        assert_eq!(bus.observer_count(names::ALL_TICKERS), 0);
        assert_eq!(bus.observer_count(names::READY), 0);
    }
}
