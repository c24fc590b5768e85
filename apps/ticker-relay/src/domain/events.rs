//! Client Event Types
//!
//! Everything the exchange client publishes on the event bus: lifecycle
//! notifications (open, close, reconnect, subscription outcomes, errors)
//! and market payloads (tickers, raw frames).

use std::error::Error as StdError;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Reserved event names.
pub mod names {
    /// Catch-all channel receiving every emission.
    pub const WILDCARD: &str = "*";
    /// Transport opened.
    pub const OPEN: &str = "open";
    /// Welcome received, connection usable.
    pub const READY: &str = "ready";
    /// Transport closed.
    pub const CLOSE: &str = "close";
    /// Any failure.
    pub const ERROR: &str = "error";
    /// Reconnect scheduled.
    pub const RECONNECT: &str = "reconnect";
    /// Subscribe deferred because the connection is not open.
    pub const SOCKET_NOT_READY: &str = "socket-not-ready";
    /// Subscribe frame sent.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Unsubscribe frame sent.
    pub const UNSUBSCRIPTION: &str = "unsubscription";
    /// Subscribe re-attempt after a failed send.
    pub const RETRY_SUBSCRIPTION: &str = "retry-subscription";
    /// Unsolicited welcome frame.
    pub const WELCOME: &str = "welcome";
    /// Unsolicited pong frame.
    pub const PONG: &str = "pong";
    /// Normalized `/market/ticker:all` update.
    pub const ALL_TICKERS: &str = "all-tickers";
    /// Normalized single-symbol ticker update.
    pub const TRADE_TICKER: &str = "trade.ticker";
}

/// Ticker payload after base/quote normalization.
///
/// `data` is the exchange payload with `baseAsset` and `quoteAsset` merged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketTicker {
    /// Merged ticker fields.
    pub data: Map<String, Value>,
}

impl MarketTicker {
    /// Merge `base`/`quote` into a copy of `data`.
    ///
    /// Non-object payloads are wrapped so the asset fields are always present.
    #[must_use]
    pub fn normalize(data: Value, base: &str, quote: &str) -> Self {
        let mut map = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert("baseAsset".to_string(), Value::String(base.to_string()));
        map.insert("quoteAsset".to_string(), Value::String(quote.to_string()));
        Self { data: map }
    }

    /// `BASE-QUOTE` pair label.
    #[must_use]
    pub fn pair(&self) -> String {
        format!(
            "{}-{}",
            self.field("baseAsset").unwrap_or_default(),
            self.field("quoteAsset").unwrap_or_default()
        )
    }

    /// Last traded price as sent by the exchange.
    #[must_use]
    pub fn price(&self) -> Option<&str> {
        self.field("price")
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Subscription outcome payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionNotice {
    /// Topic concerned.
    pub topic: String,
    /// Human-readable outcome.
    pub message: String,
}

/// Event message body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Plain status text.
    Text(String),
    /// Subscription outcome.
    Subscription(SubscriptionNotice),
    /// Normalized ticker.
    Ticker(MarketTicker),
    /// Unclassified frame as received.
    Raw(Value),
}

/// One emission on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    /// Channel name the event was emitted on.
    pub event: String,
    /// Event body.
    pub message: EventPayload,
    /// Whether this reports a failure.
    pub is_error: bool,
    /// Rendered error source chain, for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl ClientEvent {
    /// Build a non-error event.
    #[must_use]
    pub fn new(event: impl Into<String>, message: EventPayload) -> Self {
        Self {
            event: event.into(),
            message,
            is_error: false,
            cause: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a text event.
    #[must_use]
    pub fn text(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(event, EventPayload::Text(message.into()))
    }

    /// Build an `error` event from any error, capturing its source chain.
    #[must_use]
    pub fn error(err: &(dyn StdError + 'static)) -> Self {
        Self {
            event: names::ERROR.to_string(),
            message: EventPayload::Text(err.to_string()),
            is_error: true,
            cause: Some(render_chain(err)),
            timestamp: Utc::now(),
        }
    }

    /// Build an `error` event from a message reported by the exchange.
    #[must_use]
    pub fn remote_error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            event: names::ERROR.to_string(),
            cause: Some(message.clone()),
            message: EventPayload::Text(message),
            is_error: true,
            timestamp: Utc::now(),
        }
    }

    /// Ticker body, if this event carries one.
    #[must_use]
    pub const fn ticker(&self) -> Option<&MarketTicker> {
        match &self.message {
            EventPayload::Ticker(ticker) => Some(ticker),
            _ => None,
        }
    }
}

fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let _ = write!(rendered, ": {inner}");
        source = inner.source();
    }
    rendered
}

/// Normalized price update relayed to downstream subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerEvent {
    /// `BASE-QUOTE` pair.
    pub pair: String,
    /// Price as a decimal string.
    pub price_number: String,
    /// Exchange identifier.
    pub exchange: String,
    /// When the update was produced.
    pub timestamp: DateTime<Utc>,
}

impl TickerEvent {
    /// Build from a normalized ticker; `None` when the ticker has no price.
    #[must_use]
    pub fn from_ticker(ticker: &MarketTicker, exchange: &str) -> Option<Self> {
        Some(Self {
            pair: ticker.pair(),
            price_number: ticker.price()?.to_string(),
            exchange: exchange.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Wire body of the `update-prices` broadcast.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "tokenPrice": {
                "pair": self.pair,
                "priceNumber": self.price_number,
            },
            "exchange": self.exchange,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_merges_assets() {
        let ticker = MarketTicker::normalize(json!({"price": "50000"}), "BTC", "USDT");
        assert_eq!(
            Value::Object(ticker.data.clone()),
            json!({"price": "50000", "baseAsset": "BTC", "quoteAsset": "USDT"})
        );
        assert_eq!(ticker.pair(), "BTC-USDT");
        assert_eq!(ticker.price(), Some("50000"));
    }

    #[test]
    fn normalize_wraps_scalars() {
        let ticker = MarketTicker::normalize(json!("x"), "ETH", "BTC");
        assert_eq!(ticker.data.get("value"), Some(&json!("x")));
        assert_eq!(ticker.pair(), "ETH-BTC");
    }

    #[test]
    fn error_event_captures_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("inner"));
        let event = ClientEvent::error(&err);
        assert!(event.is_error);
        assert_eq!(event.event, names::ERROR);
        assert_eq!(event.cause.as_deref(), Some("outer: inner"));
    }

    #[test]
    fn ticker_event_wire_shape() {
        let ticker = MarketTicker::normalize(json!({"price": "1.5"}), "ADA", "USDT");
        let event = TickerEvent::from_ticker(&ticker, "kucoin").unwrap();
        assert_eq!(
            event.to_wire(),
            json!({"tokenPrice": {"pair": "ADA-USDT", "priceNumber": "1.5"}, "exchange": "kucoin"})
        );
    }

    #[test]
    fn ticker_without_price_is_skipped() {
        let ticker = MarketTicker::normalize(json!({}), "ADA", "USDT");
        assert!(TickerEvent::from_ticker(&ticker, "kucoin").is_none());
    }

    #[test]
    fn client_event_serializes_camel_case() {
        let event = ClientEvent::text(names::OPEN, "socket is open now");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "open");
        assert_eq!(value["isError"], false);
        assert_eq!(value["message"], "socket is open now");
        assert!(value.get("cause").is_none());
    }
}
