//! KuCoin WebSocket Message Types
//!
//! Wire format of the control frames we send and the frames the exchange
//! pushes back.
//!
//! # Outbound (JSON)
//! ```json
//! {"id":"1545910660739","type":"subscribe","topic":"/market/ticker:all","response":true}
//! {"id":"ping-1545910590801","type":"ping"}
//! ```
//!
//! # Inbound (JSON)
//! ```json
//! {"id":"hQvf8jkno","type":"welcome"}
//! {"id":"ping-1545910590801","type":"pong"}
//! {"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{"price":"50000"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::topic::Topic;

/// Control frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Subscribe to a topic.
    Subscribe,
    /// Unsubscribe from a topic.
    Unsubscribe,
    /// Application-level ping.
    Ping,
}

/// Frame sent to the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFrame {
    /// Correlation id echoed in the server's reply.
    pub id: String,
    /// Frame kind.
    #[serde(rename = "type")]
    pub kind: ControlKind,
    /// Topic for (un)subscribe frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Ask the server to acknowledge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
    /// Private channel framing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_channel: Option<bool>,
}

impl ControlFrame {
    /// Subscribe frame for `topic`.
    #[must_use]
    pub fn subscribe(id: impl Into<String>, topic: &Topic) -> Self {
        Self::topic_frame(id.into(), ControlKind::Subscribe, topic)
    }

    /// Unsubscribe frame for `topic`.
    #[must_use]
    pub fn unsubscribe(id: impl Into<String>, topic: &Topic) -> Self {
        Self::topic_frame(id.into(), ControlKind::Unsubscribe, topic)
    }

    /// Ping frame.
    #[must_use]
    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ControlKind::Ping,
            topic: None,
            response: None,
            private_channel: None,
        }
    }

    fn topic_frame(id: String, kind: ControlKind, topic: &Topic) -> Self {
        Self {
            id,
            kind,
            topic: Some(topic.name().to_string()),
            response: Some(true),
            private_channel: topic.is_private().then_some(true),
        }
    }

    /// Serialize to the JSON text sent on the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frame received from the exchange.
///
/// Every field is optional; classification happens in the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundFrame {
    /// Correlation id.
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: Option<String>,
    /// `welcome`, `pong`, `ack`, `error`, `message`, ...
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Topic for pushed messages.
    #[serde(default)]
    pub topic: Option<String>,
    /// Subject for pushed messages.
    #[serde(default)]
    pub subject: Option<String>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
}

// KuCoin sends ids as strings but numeric ids show up on some error frames.
fn id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
