//! Socket Session
//!
//! Outbound half of one connect attempt. Frames are handed to a writer
//! task over a channel; each frame carries a one-shot acknowledgement so
//! callers learn whether the transport accepted it.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::messages::ControlFrame;
use crate::domain::connection::ConnectionStateCell;

/// A frame could not be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// No socket, or the socket is not open.
    #[error("socket is not connected")]
    NotConnected,

    /// The transport rejected the frame.
    #[error("socket rejected frame: {0}")]
    Rejected(String),

    /// The frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

type Outbound = (Message, oneshot::Sender<Result<(), SendFailure>>);

/// Cloneable handle to the writer task of one attempt.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<Outbound>,
}

impl OutboundHandle {
    /// Create a handle and the receiving end for [`run_writer`].
    #[must_use]
    pub fn channel() -> (Self, OutboundQueue) {
        // One slot per in-flight frame; senders wait for their ack anyway.
        let (tx, rx) = mpsc::channel(16);
        (Self { tx }, OutboundQueue { rx })
    }

    /// Send a control frame and wait for the transport's verdict.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] if encoding fails, the writer is gone, or the
    /// transport rejects the frame.
    pub async fn send_frame(&self, frame: &ControlFrame) -> Result<(), SendFailure> {
        let text = frame
            .to_json()
            .map_err(|e| SendFailure::Encode(e.to_string()))?;
        self.send(Message::Text(text.into())).await
    }

    /// Send a raw message and wait for the transport's verdict.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure::NotConnected`] if the writer task has stopped.
    pub async fn send(&self, message: Message) -> Result<(), SendFailure> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((message, ack_tx))
            .await
            .map_err(|_| SendFailure::NotConnected)?;
        ack_rx.await.unwrap_or(Err(SendFailure::NotConnected))
    }

    /// Whether the writer task is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The current attempt's outbound handle, gated on the connection state.
///
/// Senders outside the attempt (subscriptions) go through the slot so they
/// never write to a socket that is not open.
#[derive(Debug)]
pub struct SocketSlot {
    state: Arc<ConnectionStateCell>,
    outbound: Mutex<Option<OutboundHandle>>,
}

impl SocketSlot {
    /// Empty slot over `state`.
    #[must_use]
    pub const fn new(state: Arc<ConnectionStateCell>) -> Self {
        Self {
            state,
            outbound: Mutex::new(None),
        }
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Install the handle of a newly opened attempt.
    pub fn install(&self, handle: OutboundHandle) {
        *self.outbound.lock() = Some(handle);
    }

    /// Drop the current handle. Returns whether one was installed.
    pub fn clear(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    /// Send through the current attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure::NotConnected`] unless the connection is open,
    /// or the attempt's send error.
    pub async fn send_frame(&self, frame: &ControlFrame) -> Result<(), SendFailure> {
        if !self.is_open() {
            return Err(SendFailure::NotConnected);
        }
        let handle = self.outbound.lock().clone().ok_or(SendFailure::NotConnected)?;
        handle.send_frame(frame).await
    }
}

/// Receiving end of an [`OutboundHandle`].
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
}

/// Drain `queue` into `sink` until cancelled or the sink fails.
///
/// On cancellation a close frame is sent on a best-effort basis.
pub async fn run_writer<S>(mut sink: S, mut queue: OutboundQueue, cancel: CancellationToken)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            next = queue.rx.recv() => {
                let Some((message, ack)) = next else { break };
                match sink.send(message).await {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Socket write failed");
                        let _ = ack.send(Err(SendFailure::Rejected(e.to_string())));
                        break;
                    }
                }
            }
        }
    }
    queue.rx.close();
    // Anything still queued is answered with NotConnected by dropping acks.
    while queue.rx.try_recv().is_ok() {}
}

/// Spawn [`run_writer`] for one attempt and cancel `attempt` when it stops.
///
/// A writer that dies on its own (write error, panic) takes the attempt
/// with it, so the supervisor sees the session end and reconnects.
pub fn spawn_writer<S>(sink: S, queue: OutboundQueue, attempt: CancellationToken) -> JoinHandle<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    let writer = tokio::spawn(run_writer(sink, queue, attempt.clone()));
    tokio::spawn(async move {
        let outcome = writer.await;
        if attempt.is_cancelled() {
            return;
        }
        match outcome {
            Ok(()) => tracing::warn!("Socket writer stopped, ending attempt"),
            Err(e) => tracing::error!(error = %e, "Socket writer failed, ending attempt"),
        }
        attempt.cancel();
    })
}
