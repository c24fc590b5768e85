//! Message Dispatcher
//!
//! Classifies inbound exchange frames, first match wins:
//!
//! 1. `(type, id)` matches a pending wait: resolve it, emit nothing
//! 2. `welcome`, `pong`, `error` frames
//! 3. `/market/ticker:all` pushes, split from `subject`
//! 4. `trade.ticker` pushes, split from the topic suffix
//! 5. anything else, under its `subject` or `type`
//!
//! Ticker pushes refresh the idle watchdog's last-contact mark.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::correlation::{CorrelationKey, CorrelationTable};
use super::messages::InboundFrame;
use super::watchdog::LastContact;
use crate::application::services::EventBus;
use crate::domain::events::{ClientEvent, EventPayload, MarketTicker, names};
use crate::domain::topic::ALL_TICKERS_TOPIC;
use crate::infrastructure::metrics::{self, FrameKind};

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Resolved a pending wait.
    Correlated(CorrelationKey),
    /// Emitted an event with this name.
    Emitted(String),
    /// Frame was not valid JSON; an `error` event was emitted.
    Malformed,
}

/// Routes frames to the correlation table or the event bus.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    correlation: Arc<CorrelationTable>,
    bus: Arc<EventBus>,
    last_contact: Arc<LastContact>,
}

impl MessageDispatcher {
    /// Build a dispatcher over shared client state.
    #[must_use]
    pub const fn new(
        correlation: Arc<CorrelationTable>,
        bus: Arc<EventBus>,
        last_contact: Arc<LastContact>,
    ) -> Self {
        Self {
            correlation,
            bus,
            last_contact,
        }
    }

    /// Dispatch frames from `frames` in receipt order until cancelled or
    /// the reader hangs up.
    pub async fn run(self, mut frames: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = frames.recv() => {
                    let Some(text) = next else { break };
                    self.dispatch(&text);
                }
            }
        }
    }

    /// Classify and route one text frame.
    pub fn dispatch(&self, text: &str) -> Dispatched {
        let parsed = serde_json::from_str::<Value>(text)
            .and_then(|raw| InboundFrame::deserialize(&raw).map(|frame| (raw, frame)));
        let (raw, frame) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                metrics::record_frame(FrameKind::Malformed);
                self.bus.emit(&ClientEvent::error(&e));
                return Dispatched::Malformed;
            }
        };

        if let (Some(kind), Some(id)) = (&frame.kind, &frame.id) {
            let key = CorrelationKey::new(kind.as_str(), id.as_str());
            if self.correlation.resolve(&key) {
                metrics::record_frame(FrameKind::Correlated);
                return Dispatched::Correlated(key);
            }
        }

        match frame.kind.as_deref() {
            Some(names::WELCOME) => {
                metrics::record_frame(FrameKind::Welcome);
                return self.emit(ClientEvent::new(names::WELCOME, EventPayload::Raw(raw)));
            }
            Some(names::PONG) => {
                metrics::record_frame(FrameKind::Pong);
                return self.emit(ClientEvent::new(names::PONG, EventPayload::Raw(raw)));
            }
            Some(names::ERROR) => {
                metrics::record_frame(FrameKind::Error);
                let message = match &frame.data {
                    Value::String(s) => s.clone(),
                    Value::Null => "exchange reported an error".to_string(),
                    other => other.to_string(),
                };
                tracing::warn!(error = %message, "Exchange sent error frame");
                return self.emit(ClientEvent::remote_error(message));
            }
            _ => {}
        }

        if frame.topic.as_deref() == Some(ALL_TICKERS_TOPIC) {
            let (base, quote) = split_pair(frame.subject.as_deref().unwrap_or_default());
            return self.emit_ticker(names::ALL_TICKERS, frame.data, base, quote);
        }

        if frame.subject.as_deref() == Some(names::TRADE_TICKER) {
            let symbol = frame
                .topic
                .as_deref()
                .and_then(|t| t.split_once(':'))
                .map_or("", |(_, symbol)| symbol);
            let (base, quote) = split_pair(symbol);
            return self.emit_ticker(names::TRADE_TICKER, frame.data, base, quote);
        }

        metrics::record_frame(FrameKind::Other);
        let name = frame
            .subject
            .or(frame.kind)
            .unwrap_or_else(|| "message".to_string());
        self.emit(ClientEvent::new(name, EventPayload::Raw(raw)))
    }

    fn emit_ticker(&self, event: &str, data: Value, base: &str, quote: &str) -> Dispatched {
        self.last_contact.touch();
        metrics::record_frame(FrameKind::Ticker);
        let ticker = MarketTicker::normalize(data, base, quote);
        self.emit(ClientEvent::new(event, EventPayload::Ticker(ticker)))
    }

    fn emit(&self, event: ClientEvent) -> Dispatched {
        self.bus.emit(&event);
        Dispatched::Emitted(event.event)
    }
}

fn split_pair(symbol: &str) -> (&str, &str) {
    symbol.split_once('-').unwrap_or((symbol, ""))
}
