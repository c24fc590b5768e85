//! Idle Watchdog
//!
//! Detects a stalled data feed. The socket can stay up and keep answering
//! pings while the exchange stops pushing tickers; when no ticker-class
//! frame arrives for longer than the idle threshold while the connection is
//! open, the watchdog asks the supervisor to reconnect.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::ConnectionStateCell;

/// Time of the last ticker-class frame.
#[derive(Debug)]
pub struct LastContact {
    at: Mutex<Instant>,
}

impl Default for LastContact {
    fn default() -> Self {
        Self::new()
    }
}

impl LastContact {
    /// Mark as of now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            at: Mutex::new(Instant::now()),
        }
    }

    /// Record contact now.
    pub fn touch(&self) {
        *self.at.lock() = Instant::now();
    }

    /// Time since the last contact.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.at.lock().elapsed()
    }
}

/// Floor for the check period; `tokio::time::interval` rejects zero.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// How often to check.
    pub check_interval: Duration,
    /// Silence tolerated before forcing a reconnect.
    pub idle_threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(10),
        }
    }
}

/// Signal sent to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// No ticker frame for `idle_for` while open.
    Idle {
        /// Observed silence.
        idle_for: Duration,
    },
}

/// Periodic idle check over the client's lifetime.
pub struct IdleWatchdog {
    config: WatchdogConfig,
    last_contact: Arc<LastContact>,
    state: Arc<ConnectionStateCell>,
    events: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl IdleWatchdog {
    /// Build a watchdog. `cancel` should be the client's token.
    #[must_use]
    pub const fn new(
        config: WatchdogConfig,
        last_contact: Arc<LastContact>,
        state: Arc<ConnectionStateCell>,
        events: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            last_contact,
            state,
            events,
            cancel,
        }
    }

    /// Run until cancelled or the supervisor stops listening.
    pub async fn run(self) {
        let period = self.config.check_interval.max(MIN_CHECK_INTERVAL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.check() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Idle watchdog stopped");
    }

    /// Returns `false` once the supervisor is gone.
    fn check(&self) -> bool {
        if !self.state.is_open() {
            return true;
        }
        let idle_for = self.last_contact.elapsed();
        if idle_for <= self.config.idle_threshold {
            return true;
        }

        tracing::warn!(
            idle_ms = idle_for.as_millis(),
            threshold_ms = self.config.idle_threshold.as_millis(),
            "No ticker data received, forcing reconnect"
        );
        // One stall, one reconnect.
        self.last_contact.touch();
        match self.events.try_send(WatchdogEvent::Idle { idle_for }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connection::ConnectionState;

    fn open_cell() -> Arc<ConnectionStateCell> {
        let cell = Arc::new(ConnectionStateCell::new());
        cell.transition(ConnectionState::Connecting).unwrap();
        cell.transition(ConnectionState::Open).unwrap();
        cell
    }

    fn spawn_watchdog(
        state: Arc<ConnectionStateCell>,
        last_contact: Arc<LastContact>,
    ) -> (mpsc::Receiver<WatchdogEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(
            IdleWatchdog::new(
                WatchdogConfig::default(),
                last_contact,
                state,
                tx,
                cancel.clone(),
            )
            .run(),
        );
        (rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_stall_within_one_tick() {
        let last_contact = Arc::new(LastContact::new());
        let (mut rx, cancel) = spawn_watchdog(open_cell(), Arc::clone(&last_contact));

        let started = Instant::now();
        let Some(WatchdogEvent::Idle { idle_for }) = rx.recv().await else {
            panic!("watchdog stopped");
        };
        assert!(idle_for > Duration::from_secs(10));
        assert!(started.elapsed() <= Duration::from_secs(11));

        // The mark was reset; nothing until another full threshold passes.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_check_interval_still_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            IdleWatchdog::new(
                WatchdogConfig {
                    check_interval: Duration::ZERO,
                    idle_threshold: Duration::from_millis(50),
                },
                Arc::new(LastContact::new()),
                open_cell(),
                tx,
                cancel.clone(),
            )
            .run(),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(event, Ok(Some(WatchdogEvent::Idle { .. }))));
        cancel.cancel();
        assert!(task.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_contact_keeps_it_quiet() {
        let last_contact = Arc::new(LastContact::new());
        let (mut rx, cancel) = spawn_watchdog(open_cell(), Arc::clone(&last_contact));

        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            last_contact.touch();
        }
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_silence_while_not_open() {
        let last_contact = Arc::new(LastContact::new());
        let (mut rx, cancel) =
            spawn_watchdog(Arc::new(ConnectionStateCell::new()), last_contact);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
