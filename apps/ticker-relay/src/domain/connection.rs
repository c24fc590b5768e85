//! Connection State Machine
//!
//! The lifecycle of the single exchange connection owned by a client.
//!
//! ```text
//! Disconnected ──► Connecting ──► Open ──► Closing ──► Disconnected
//!                      │            │                      ▲
//!                      │            └──────────────────────┤
//!                      ├──► Closing                        │
//!                      └───────────────────────────────────┘
//! ```
//!
//! A fresh attempt always passes through `Connecting`; `Open` is only
//! reachable from `Connecting`.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket, no attempt in progress.
    #[default]
    Disconnected,
    /// Handshake, socket open and welcome wait in progress.
    Connecting,
    /// Welcome received; frames may be sent.
    Open,
    /// Operator-requested close in progress.
    Closing,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Open | Self::Disconnected | Self::Closing)
                | (Self::Open, Self::Closing | Self::Disconnected)
                | (Self::Closing, Self::Disconnected)
        )
    }

    /// Lowercase name used in logs and health payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short-lived credentials for one connect attempt.
///
/// Fetched fresh for every attempt and dropped with it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken {
    /// Bullet token appended to the socket URL.
    pub token: String,
    /// WebSocket endpoint of the first instance server.
    pub endpoint: String,
    /// Server-advised ping interval.
    pub ping_interval: Duration,
    /// Server-advised ping timeout.
    pub ping_timeout: Duration,
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("token", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .finish()
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection state transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State at the time of the request.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

/// Shared, observable connection state.
///
/// Writes are validated against [`ConnectionState::can_transition_to`];
/// readers either poll [`ConnectionStateCell::get`] or wait on a
/// [`watch::Receiver`].
#[derive(Debug)]
pub struct ConnectionStateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateCell {
    /// Create a cell in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Whether the connection is `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Transitioning to the current state is a no-op and succeeds.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        let mut outcome = Ok(next);
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from == next {
                outcome = Ok(from);
                return false;
            }
            if !from.can_transition_to(next) {
                outcome = Err(InvalidTransition { from, to: next });
                return false;
            }
            *current = next;
            outcome = Ok(from);
            true
        });
        outcome
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
