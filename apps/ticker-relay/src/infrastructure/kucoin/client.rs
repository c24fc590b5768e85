//! KuCoin WebSocket Client
//!
//! Supervises the single exchange connection:
//!
//! 1. fetch a bullet token and open `endpoint?token=..&connectId=..`
//! 2. emit `open`, start the reader, writer, dispatcher and heartbeat
//! 3. wait for the `welcome` frame correlated by connect id
//! 4. mark the connection open and emit `ready`
//! 5. on close, error or idle stall, tear the attempt down and retry
//!
//! Each attempt runs under a child cancellation token so tearing it down
//! stops every task it spawned. The idle watchdog runs for the client's
//! whole lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::bullet::{build_socket_url, new_connect_id};
use super::correlation::{CorrelationKey, CorrelationTable, WaitOutcome};
use super::dispatcher::MessageDispatcher;
use super::heartbeat::{HeartbeatConfig, HeartbeatController, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{OutboundHandle, SocketSlot, spawn_writer};
use super::subscription::{SubscriptionManager, SubscriptionSettings};
use super::watchdog::{IdleWatchdog, LastContact, WatchdogConfig, WatchdogEvent};
use crate::WebSocketSettings;
use crate::application::ports::{ConnectionStatus, HandshakeError, TokenProvider};
use crate::application::services::{EventBus, ObserverId};
use crate::domain::connection::{ConnectionState, ConnectionStateCell, InvalidTransition};
use crate::domain::events::{ClientEvent, names};
use crate::domain::topic::Topic;
use crate::infrastructure::metrics::{self, ReconnectReason};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound frames buffered between the reader and the dispatcher.
const FRAME_BUFFER: usize = 1_024;

/// Client timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Delay and budget between attempts.
    pub reconnect: ReconnectConfig,
    /// Bound on the welcome wait and each pong wait.
    pub max_wait: Duration,
    /// Subscription timing.
    pub subscription: SubscriptionSettings,
    /// Idle watchdog timing.
    pub watchdog: WatchdogConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}

impl ClientSettings {
    /// Derive from the websocket settings.
    #[must_use]
    pub const fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_settings(settings),
            max_wait: settings.max_wait,
            subscription: SubscriptionSettings {
                not_ready_delay: settings.reconnect_delay,
                retry_delay: settings.subscription_retry_delay,
            },
            watchdog: WatchdogConfig {
                check_interval: settings.idle_check_interval,
                idle_threshold: settings.idle_timeout,
            },
        }
    }
}

/// Terminal client failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Every allowed reconnect attempt failed.
    #[error("gave up after {0} reconnect attempts")]
    RetryBudgetExhausted(u32),
}

/// Why one connect attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// Bullet handshake failed.
    #[error("handshake failed")]
    Handshake(#[from] HandshakeError),

    /// Socket could not be opened.
    #[error("websocket connect failed")]
    Connect(#[from] tungstenite::Error),

    /// Socket did not open in time.
    #[error("websocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No welcome frame within the wait.
    #[error("no welcome frame within {0:?}")]
    WelcomeTimeout(Duration),

    /// The client stopped during the attempt.
    #[error("connect attempt cancelled")]
    Cancelled,

    /// State changed underneath the attempt.
    #[error(transparent)]
    State(#[from] InvalidTransition),
}

/// How the reader saw the socket end.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseCause {
    /// Close frame from the server.
    Remote { code: Option<u16>, reason: String },
    /// Read error.
    Failed(String),
    /// Stream ended without a close frame.
    Ended,
    /// Attempt cancelled.
    Cancelled,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { code: Some(code), reason } => write!(f, "closed by server ({code}) {reason}"),
            Self::Remote { code: None, reason } => write!(f, "closed by server {reason}"),
            Self::Failed(e) => write!(f, "transport error: {e}"),
            Self::Ended => f.write_str("stream ended"),
            Self::Cancelled => f.write_str("closed locally"),
        }
    }
}

/// Socket read failure surfaced on the event bus.
#[derive(Debug, thiserror::Error)]
#[error("websocket transport error: {0}")]
struct TransportError(String);

/// Live attempt after `ready`.
struct Session {
    attempt: CancellationToken,
    reader: JoinHandle<CloseCause>,
    heartbeat: Arc<HeartbeatState>,
}

enum SessionEnd {
    Closed(CloseCause),
    Idle(Duration),
    Stopped,
}

/// Supervised connection to the KuCoin WebSocket feed.
pub struct KucoinWsClient {
    tokens: Arc<dyn TokenProvider>,
    settings: ClientSettings,
    state: Arc<ConnectionStateCell>,
    slot: Arc<SocketSlot>,
    correlation: Arc<CorrelationTable>,
    last_contact: Arc<LastContact>,
    bus: Arc<EventBus>,
    subscriptions: SubscriptionManager,
    closing_requested: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for KucoinWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KucoinWsClient")
            .field("state", &self.state.get())
            .field("private", &self.tokens.is_private())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl KucoinWsClient {
    /// Build a client. Nothing connects until [`KucoinWsClient::run`].
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        bus: Arc<EventBus>,
        settings: ClientSettings,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(ConnectionStateCell::new());
        let slot = Arc::new(SocketSlot::new(Arc::clone(&state)));
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&slot),
            Arc::clone(&bus),
            settings.subscription,
            cancel.clone(),
        );
        Self {
            tokens,
            settings,
            state,
            slot,
            correlation: Arc::new(CorrelationTable::new()),
            last_contact: Arc::new(LastContact::new()),
            bus,
            subscriptions,
            closing_requested: AtomicBool::new(false),
            cancel,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether tokens come from the private bullet endpoint.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.tokens.is_private()
    }

    /// The bus this client emits on.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register an observer for `event` on the client's bus.
    pub fn on<F>(&self, event: &str, observer: F) -> ObserverId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.bus.on(event, observer)
    }

    /// Subscribe to `topic` in the background; see [`SubscriptionManager`].
    pub fn subscribe_to(&self, topic: Topic) -> JoinHandle<bool> {
        self.subscriptions.subscribe_to(topic)
    }

    /// One best-effort unsubscribe.
    pub async fn unsubscribe_from(&self, topic: &Topic) -> bool {
        self.subscriptions.unsubscribe_from(topic).await
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if self.closing_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(state = %self.state.get(), "Disconnect requested");
        if matches!(
            self.state.get(),
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            let _ = self.state.transition(ConnectionState::Closing);
        }
        self.cancel.cancel();
    }

    fn stop_requested(&self) -> bool {
        self.closing_requested.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Connect and keep the connection alive until [`KucoinWsClient::disconnect`]
    /// or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RetryBudgetExhausted`] when a finite retry
    /// budget runs out.
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        let lifetime = self.cancel.child_token();
        let (idle_tx, mut idle_rx) = mpsc::channel(1);
        let watchdog = tokio::spawn(
            IdleWatchdog::new(
                self.settings.watchdog,
                Arc::clone(&self.last_contact),
                Arc::clone(&self.state),
                idle_tx,
                lifetime.clone(),
            )
            .run(),
        );
        let bus = Arc::clone(&self.bus);
        let watchdog = tokio::spawn(async move {
            if let Err(e) = watchdog.await
                && !e.is_cancelled()
            {
                tracing::error!(error = %e, "Idle watchdog failed, stalls will go undetected");
                bus.emit(&ClientEvent::error(&e));
            }
        });

        let result = self.supervise(&mut idle_rx).await;

        lifetime.cancel();
        let _ = watchdog.await;
        self.slot.clear();
        self.correlation.cancel_all();
        if self.state.get() != ConnectionState::Disconnected {
            let _ = self.state.transition(ConnectionState::Disconnected);
        }
        match &result {
            Ok(()) => tracing::info!("KuCoin client stopped"),
            Err(e) => tracing::error!(error = %e, "KuCoin client giving up"),
        }
        result
    }

    async fn supervise(
        &self,
        idle_rx: &mut mpsc::Receiver<WatchdogEvent>,
    ) -> Result<(), ClientError> {
        let mut policy = ReconnectPolicy::new(self.settings.reconnect.clone());

        loop {
            if self.stop_requested() {
                return Ok(());
            }

            let reason = match self.connect().await {
                Ok(session) => {
                    policy.reset();
                    while idle_rx.try_recv().is_ok() {}
                    match self.hold(session, idle_rx).await {
                        SessionEnd::Stopped => return Ok(()),
                        SessionEnd::Closed(_) => ReconnectReason::Closed,
                        SessionEnd::Idle(_) => ReconnectReason::Idle,
                    }
                }
                Err(AttemptError::Cancelled) if self.stop_requested() => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "KuCoin connect attempt failed");
                    self.bus.emit(&ClientEvent::error(&e));
                    ReconnectReason::AttemptFailed
                }
            };

            if self.stop_requested() {
                return Ok(());
            }
            let Some(delay) = policy.next_delay() else {
                return Err(ClientError::RetryBudgetExhausted(policy.max_attempts()));
            };
            metrics::record_reconnect(reason);
            tracing::info!(
                attempt = policy.attempts(),
                delay_ms = delay.as_millis(),
                reason = reason.as_str(),
                "Reconnecting to KuCoin"
            );
            if reason != ReconnectReason::AttemptFailed {
                self.bus.emit(&ClientEvent::text(
                    names::RECONNECT,
                    format!("reconnecting in {}ms", delay.as_millis()),
                ));
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt from handshake to `ready`.
    async fn connect(&self) -> Result<Session, AttemptError> {
        self.state.transition(ConnectionState::Connecting)?;
        let attempt = self.cancel.child_token();
        let mut opened = false;

        match self.open_session(&attempt, &mut opened).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.teardown(&attempt, opened.then_some(&CloseCause::Cancelled));
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        attempt: &CancellationToken,
        opened: &mut bool,
    ) -> Result<Session, AttemptError> {
        let token = tokio::select! {
            () = attempt.cancelled() => return Err(AttemptError::Cancelled),
            token = self.tokens.fetch_token() => token?,
        };

        let connect_id = new_connect_id();
        let url = build_socket_url(&token, &connect_id);
        tracing::info!(endpoint = %token.endpoint, connect_id = %connect_id, "Connecting to KuCoin");

        let (socket, _response) = tokio::select! {
            () = attempt.cancelled() => return Err(AttemptError::Cancelled),
            res = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())) => {
                res.map_err(|_| AttemptError::ConnectTimeout(CONNECT_TIMEOUT))??
            }
        };
        *opened = true;
        self.bus.emit(&ClientEvent::text(names::OPEN, "socket opened"));

        // Registered before the reader starts so an early welcome is not lost.
        let welcome = self
            .correlation
            .register(CorrelationKey::new(names::WELCOME, connect_id));

        let (sink, stream) = socket.split();
        let (outbound, queue) = OutboundHandle::channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&self.correlation),
            Arc::clone(&self.bus),
            Arc::clone(&self.last_contact),
        );
        let heartbeat = Arc::new(HeartbeatState::new());

        spawn_writer(sink, queue, attempt.clone());
        tokio::spawn(dispatcher.run(frames_rx, attempt.clone()));
        let reader = tokio::spawn(read_frames(stream, frames_tx, attempt.clone()));
        tokio::spawn(
            HeartbeatController::new(
                HeartbeatConfig::from_token(&token, self.settings.max_wait),
                Arc::clone(&heartbeat),
                outbound.clone(),
                Arc::clone(&self.correlation),
                attempt.clone(),
            )
            .run(),
        );

        let outcome = tokio::select! {
            () = attempt.cancelled() => WaitOutcome::Cancelled,
            outcome = welcome.wait(self.settings.max_wait) => outcome,
        };
        match outcome {
            WaitOutcome::Resolved => {}
            WaitOutcome::TimedOut => {
                reader.abort();
                return Err(AttemptError::WelcomeTimeout(self.settings.max_wait));
            }
            WaitOutcome::Cancelled => {
                reader.abort();
                return Err(AttemptError::Cancelled);
            }
        }

        self.slot.install(outbound);
        if let Err(e) = self.state.transition(ConnectionState::Open) {
            reader.abort();
            return Err(if self.stop_requested() {
                AttemptError::Cancelled
            } else {
                e.into()
            });
        }
        self.last_contact.touch();
        metrics::set_exchange_connected(true);
        tracing::info!("KuCoin connection ready");
        self.bus.emit(&ClientEvent::text(names::READY, "welcome received"));

        Ok(Session {
            attempt: attempt.clone(),
            reader,
            heartbeat,
        })
    }

    /// Wait for the session to end, then tear it down.
    async fn hold(
        &self,
        session: Session,
        idle_rx: &mut mpsc::Receiver<WatchdogEvent>,
    ) -> SessionEnd {
        let Session {
            attempt,
            mut reader,
            heartbeat,
        } = session;

        let end = tokio::select! {
            () = self.cancel.cancelled() => SessionEnd::Stopped,
            cause = &mut reader => SessionEnd::Closed(cause.unwrap_or(CloseCause::Ended)),
            Some(WatchdogEvent::Idle { idle_for }) = idle_rx.recv() => SessionEnd::Idle(idle_for),
        };

        let cause = match &end {
            SessionEnd::Closed(cause) => {
                if let CloseCause::Failed(e) = cause {
                    self.bus.emit(&ClientEvent::error(&TransportError(e.clone())));
                }
                cause.clone()
            }
            SessionEnd::Idle(idle_for) => CloseCause::Failed(format!(
                "no ticker data for {}ms",
                idle_for.as_millis()
            )),
            SessionEnd::Stopped => CloseCause::Cancelled,
        };
        tracing::info!(
            cause = %cause,
            pings = heartbeat.pings_sent(),
            missed_pongs = heartbeat.missed_pongs(),
            "KuCoin session ended"
        );

        reader.abort();
        self.teardown(&attempt, Some(&cause));
        end
    }

    /// Stop the attempt's tasks and release its resources.
    fn teardown(&self, attempt: &CancellationToken, closed: Option<&CloseCause>) {
        attempt.cancel();
        self.slot.clear();
        let cancelled = self.correlation.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled pending waits");
        }
        metrics::set_exchange_connected(false);
        if let Err(e) = self.state.transition(ConnectionState::Disconnected) {
            tracing::warn!(error = %e, "Unexpected state during teardown");
        }
        if let Some(cause) = closed {
            self.bus.emit(&ClientEvent::text(names::CLOSE, cause.to_string()));
        }
    }
}

impl ConnectionStatus for KucoinWsClient {
    fn is_socket_open(&self) -> bool {
        self.state.is_open()
    }
}

async fn read_frames<S>(
    mut stream: S,
    frames: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> CloseCause
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return CloseCause::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                let sent = tokio::select! {
                    () = cancel.cancelled() => return CloseCause::Cancelled,
                    sent = frames.send(text.as_str().to_owned()) => sent,
                };
                if sent.is_err() {
                    return CloseCause::Cancelled;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return CloseCause::Remote {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return CloseCause::Failed(e.to_string()),
            None => return CloseCause::Ended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockTokenProvider;

    fn failing_tokens(times: usize) -> Arc<MockTokenProvider> {
        let mut tokens = MockTokenProvider::new();
        tokens
            .expect_fetch_token()
            .times(times)
            .returning(|| Err(HandshakeError::NoInstanceServers));
        tokens.expect_is_private().return_const(false);
        Arc::new(tokens)
    }

    fn settings(max_attempts: u32) -> ClientSettings {
        ClientSettings {
            reconnect: ReconnectConfig::fixed(Duration::from_secs(1), max_attempts),
            ..ClientSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finite_budget_is_exhausted() {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(parking_lot::Mutex::new(0));
        let counter = Arc::clone(&errors);
        bus.on(names::ERROR, move |_| *counter.lock() += 1);

        let client = Arc::new(KucoinWsClient::new(
            failing_tokens(3),
            bus,
            settings(2),
            CancellationToken::new(),
        ));

        assert_eq!(
            Arc::clone(&client).run().await,
            Err(ClientError::RetryBudgetExhausted(2))
        );
        assert_eq!(*errors.lock(), 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_is_terminal() {
        let mut tokens = MockTokenProvider::new();
        tokens
            .expect_fetch_token()
            .returning(|| Err(HandshakeError::Network("refused".into())));
        tokens.expect_is_private().return_const(false);

        let client = Arc::new(KucoinWsClient::new(
            Arc::new(tokens),
            Arc::new(EventBus::new()),
            settings(0),
            CancellationToken::new(),
        ));
        let task = tokio::spawn(Arc::clone(&client).run());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        client.disconnect();
        client.disconnect();

        assert_eq!(task.await.unwrap(), Ok(()));
        assert!(!client.is_socket_open());
    }

    #[test]
    fn settings_follow_websocket_settings() {
        let ws = WebSocketSettings {
            reconnect_delay: Duration::from_millis(300),
            subscription_retry_delay: Duration::from_millis(700),
            max_wait: Duration::from_millis(900),
            idle_timeout: Duration::from_secs(5),
            idle_check_interval: Duration::from_millis(250),
            max_reconnect_attempts: 4,
            ..WebSocketSettings::default()
        };
        let settings = ClientSettings::from_settings(&ws);
        assert_eq!(settings.reconnect.base_delay, Duration::from_millis(300));
        assert_eq!(settings.reconnect.max_attempts, 4);
        assert_eq!(settings.subscription.not_ready_delay, Duration::from_millis(300));
        assert_eq!(settings.subscription.retry_delay, Duration::from_millis(700));
        assert_eq!(settings.watchdog.idle_threshold, Duration::from_secs(5));
        assert_eq!(settings.max_wait, Duration::from_millis(900));
    }

    #[test]
    fn close_cause_rendering() {
        assert_eq!(
            CloseCause::Remote {
                code: Some(1000),
                reason: "bye".into()
            }
            .to_string(),
            "closed by server (1000) bye"
        );
        assert_eq!(CloseCause::Ended.to_string(), "stream ended");
    }
}
