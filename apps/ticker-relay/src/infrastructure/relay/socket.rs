//! Relay WebSocket endpoint.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::hub::SharedRelayHub;
use super::protocol::{Envelope, JOIN_PRICES_ROOM, PRICES_ROOM};

/// Router serving the relay socket at `/ws`.
pub fn relay_router(hub: SharedRelayHub) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<SharedRelayHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: SharedRelayHub) {
    let client_id = uuid::Uuid::new_v4();
    let (mut tx, mut rx) = socket.split();
    let mut room: Option<broadcast::Receiver<Arc<str>>> = None;
    tracing::debug!(%client_id, "Relay client connected");

    loop {
        let outgoing = tokio::select! {
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_request(&hub, &mut room, client_id, text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => None,
            },
            update = next_update(&mut room) => match update {
                Ok(text) => Some(text.to_string()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%client_id, skipped, "Relay client lagging, updates skipped");
                    None
                }
                Err(RecvError::Closed) => {
                    room = None;
                    None
                }
            },
        };

        if let Some(text) = outgoing {
            if tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    }

    if room.take().is_some() {
        hub.left();
    }
    tracing::debug!(%client_id, "Relay client disconnected");
}

/// Reply to one client request, if it needs a reply.
fn handle_request(
    hub: &SharedRelayHub,
    room: &mut Option<broadcast::Receiver<Arc<str>>>,
    client_id: uuid::Uuid,
    text: &str,
) -> Option<String> {
    let request = match Envelope::parse(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(%client_id, error = %e, "Ignoring malformed relay request");
            return Some(Envelope::new("error", "malformed request").to_text());
        }
    };

    match request.event.as_str() {
        "ping" => Some(Envelope::pong().to_text()),
        "subscribe" if request.data.as_str() == Some(JOIN_PRICES_ROOM) => {
            if room.is_none() {
                *room = Some(hub.join());
                tracing::debug!(%client_id, room = PRICES_ROOM, "Relay client joined");
            }
            None
        }
        "subscribe" => Some(Envelope::new("error", "unknown room").to_text()),
        other => {
            tracing::debug!(%client_id, event = other, "Ignoring unknown relay event");
            None
        }
    }
}

async fn next_update(room: &mut Option<broadcast::Receiver<Arc<str>>>) -> Result<Arc<str>, RecvError> {
    match room {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
