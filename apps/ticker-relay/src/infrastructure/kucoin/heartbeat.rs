//! Heartbeat Controller
//!
//! Sends an application-level `ping` on the server-advised interval and
//! waits a short time for the matching `pong` through the correlation
//! table. Missed pongs are logged and counted only; stale connections are
//! caught by the idle watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::correlation::{CorrelationKey, CorrelationTable, WaitOutcome};
use super::messages::ControlFrame;
use super::session::OutboundHandle;
use crate::domain::connection::ConnectionToken;
use crate::infrastructure::metrics;

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long to wait for each pong.
    pub pong_timeout: Duration,
}

impl HeartbeatConfig {
    /// Interval from the token, pong wait from the client's max wait.
    #[must_use]
    pub const fn from_token(token: &ConnectionToken, max_wait: Duration) -> Self {
        Self {
            ping_interval: token.ping_interval,
            pong_timeout: max_wait,
        }
    }
}

/// Counters for one attempt's heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    missed_pongs: AtomicU64,
    last_pong: RwLock<Option<Instant>>,
}

impl HeartbeatState {
    /// Fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
        *self.last_pong.write() = Some(Instant::now());
    }

    fn record_miss(&self) {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed);
        metrics::record_missed_pong();
    }

    /// Pings written to the socket.
    #[must_use]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    /// Pongs matched to a ping.
    #[must_use]
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    /// Pings that got no pong in time, or could not be sent.
    #[must_use]
    pub fn missed_pongs(&self) -> u64 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    /// Time since the last matched pong.
    #[must_use]
    pub fn since_last_pong(&self) -> Option<Duration> {
        self.last_pong.read().map(|at| at.elapsed())
    }
}

/// Ping loop for one connect attempt.
pub struct HeartbeatController {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    outbound: OutboundHandle,
    correlation: Arc<CorrelationTable>,
    cancel: CancellationToken,
}

impl HeartbeatController {
    /// Build a controller. `cancel` should be the attempt's token.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        outbound: OutboundHandle,
        correlation: Arc<CorrelationTable>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            outbound,
            correlation,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        if self.config.ping_interval.is_zero() {
            tracing::warn!("Server advised no ping interval, heartbeat disabled");
            return;
        }

        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat stopped");
                    break;
                }
                _ = interval.tick() => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.beat() => {}
                    }
                }
            }
        }
    }

    async fn beat(&self) {
        let id = format!("ping-{}", uuid::Uuid::new_v4().simple());
        let wait = self
            .correlation
            .register(CorrelationKey::new("pong", id.clone()));

        if let Err(e) = self.outbound.send_frame(&ControlFrame::ping(id.clone())).await {
            tracing::warn!(ping_id = %id, error = %e, "Failed to send heartbeat ping");
            self.state.record_miss();
            return;
        }
        self.state.record_ping();

        match wait.wait(self.config.pong_timeout).await {
            WaitOutcome::Resolved => {
                self.state.record_pong();
                tracing::trace!(ping_id = %id, "Pong received");
            }
            WaitOutcome::TimedOut => {
                self.state.record_miss();
                tracing::warn!(
                    ping_id = %id,
                    timeout_ms = self.config.pong_timeout.as_millis(),
                    missed = self.state.missed_pongs(),
                    since_last_pong_ms = self.state.since_last_pong().map(|d| d.as_millis()),
                    "Heartbeat pong not received"
                );
            }
            WaitOutcome::Cancelled => {}
        }
    }
}
