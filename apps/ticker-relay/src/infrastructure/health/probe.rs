//! Downstream Health Probe
//!
//! Keeps its own socket to the local relay, joins the prices room and
//! pings on an interval. Unanswered pings are counted; reaching the limit
//! drops the socket and reconnects. The result backs `/health-check/ws`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::ProbeSettings;
use crate::application::ports::LivenessProbe;
use crate::infrastructure::relay::Envelope;

/// Floor for the ping period; `tokio::time::interval` rejects zero.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Probe failure for one connection.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Relay socket could not be opened.
    #[error("probe connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    /// A frame could not be written.
    #[error("probe send failed: {0}")]
    Send(#[source] tungstenite::Error),
}

/// Point-in-time probe state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSnapshot {
    /// Probe socket is connected.
    pub connected: bool,
    /// Consecutive unanswered pings.
    pub ping_attempts: u32,
    /// Latest ping round went unanswered.
    pub pong_timed_out: bool,
}

impl ProbeSnapshot {
    const fn is_healthy(&self, max_ping_attempts: u32) -> bool {
        self.connected && !self.pong_timed_out && self.ping_attempts < max_ping_attempts
    }
}

enum SessionEnd {
    /// Too many unanswered pings.
    Unresponsive,
    /// Relay closed the socket.
    Closed,
    /// Probe stopped.
    Stopped,
}

/// Liveness probe of the relay socket.
#[derive(Debug)]
pub struct DownstreamHealthService {
    url: String,
    settings: ProbeSettings,
    state: Mutex<ProbeSnapshot>,
    cancel: CancellationToken,
}

impl DownstreamHealthService {
    /// Create a probe for the relay at `url`. Nothing runs until [`Self::run`].
    #[must_use]
    pub fn new(url: impl Into<String>, settings: ProbeSettings, cancel: CancellationToken) -> Self {
        Self {
            url: url.into(),
            settings,
            state: Mutex::new(ProbeSnapshot::default()),
            cancel,
        }
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ProbeSnapshot {
        *self.state.lock()
    }

    /// Stop probing and cancel its timers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Probe until cancelled, reconnecting after every lost connection.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(url = %self.url, "Downstream health probe started");
        while !self.cancel.is_cancelled() {
            match self.probe_once().await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Unresponsive) => {
                    tracing::warn!(
                        attempts = self.settings.max_ping_attempts,
                        "Relay unresponsive, reconnecting probe"
                    );
                    self.state.lock().connected = false;
                    continue;
                }
                Ok(SessionEnd::Closed) => {
                    tracing::warn!("Relay closed the probe socket");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Downstream health probe failed");
                }
            }
            self.state.lock().connected = false;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.ping_period()) => {}
            }
        }
        self.state.lock().connected = false;
        tracing::info!("Downstream health probe stopped");
    }

    async fn probe_once(&self) -> Result<SessionEnd, ProbeError> {
        let connect = tokio::select! {
            () = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),
            connect = tokio_tungstenite::connect_async(self.url.as_str()) => connect,
        };
        let (socket, _) = connect.map_err(ProbeError::Connect)?;
        let (mut tx, mut rx) = socket.split();

        tx.send(Message::Text(Envelope::join_prices().to_text().into()))
            .await
            .map_err(ProbeError::Send)?;

        let period = self.ping_period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;

        {
            let mut state = self.state.lock();
            state.connected = true;
            state.ping_attempts = 0;
        }
        tracing::debug!("Probe joined the prices room");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = ticker.tick() => {
                    if deadline.take().is_some() && self.pong_missed() {
                        return Ok(SessionEnd::Unresponsive);
                    }
                    tx.send(Message::Text(Envelope::ping().to_text().into()))
                        .await
                        .map_err(ProbeError::Send)?;
                    deadline = Some(Instant::now() + self.settings.pong_timeout);
                }
                () = wait_until(deadline) => {
                    deadline = None;
                    if self.pong_missed() {
                        return Ok(SessionEnd::Unresponsive);
                    }
                }
                frame = rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if is_pong(text.as_str()) {
                            deadline = None;
                            self.pong_received();
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn ping_period(&self) -> Duration {
        self.settings.ping_interval.max(MIN_PING_INTERVAL)
    }

    /// Count a timed-out ping; true once the limit is reached.
    fn pong_missed(&self) -> bool {
        let mut state = self.state.lock();
        state.ping_attempts = state.ping_attempts.saturating_add(1);
        state.pong_timed_out = true;
        tracing::warn!(attempts = state.ping_attempts, "Relay pong timed out");
        state.ping_attempts >= self.settings.max_ping_attempts
    }

    fn pong_received(&self) {
        let mut state = self.state.lock();
        state.ping_attempts = 0;
        state.pong_timed_out = false;
    }
}

impl LivenessProbe for DownstreamHealthService {
    fn is_healthy(&self) -> bool {
        self.state.lock().is_healthy(self.settings.max_ping_attempts)
    }
}

fn is_pong(text: &str) -> bool {
    Envelope::parse(text).is_ok_and(|envelope| envelope.event == "pong")
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
