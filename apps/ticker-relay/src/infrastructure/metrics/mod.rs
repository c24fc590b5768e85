//! Prometheus Metrics
//!
//! Counters and gauges for the exchange connection and the relay, rendered
//! at `/metrics` on the HTTP port. Recording is a no-op until
//! [`init_metrics`] installs the recorder, so library code and tests can
//! call the helpers unconditionally.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handle for rendering, if [`init_metrics`] ran.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "ticker_relay_frames_received_total",
        "Frames received from the exchange by classification"
    );
    describe_counter!(
        "ticker_relay_tickers_relayed_total",
        "Ticker updates published to the prices room"
    );
    describe_counter!(
        "ticker_relay_reconnects_total",
        "Exchange reconnect attempts by reason"
    );
    describe_counter!(
        "ticker_relay_missed_pongs_total",
        "Exchange heartbeat pings without a pong"
    );
    describe_counter!(
        "ticker_relay_subscription_retries_total",
        "Subscribe frames re-sent after a failure"
    );
    describe_gauge!(
        "ticker_relay_exchange_connected",
        "1 while the exchange socket is open"
    );
    describe_gauge!(
        "ticker_relay_relay_members",
        "Sockets joined to the prices room"
    );
    describe_histogram!(
        "ticker_relay_handshake_seconds",
        "Bullet handshake latency"
    );
}

/// Classification of an inbound exchange frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Resolved a pending wait.
    Correlated,
    /// Unmatched welcome.
    Welcome,
    /// Unmatched pong.
    Pong,
    /// Error frame.
    Error,
    /// Ticker update.
    Ticker,
    /// Anything else.
    Other,
    /// Not valid JSON.
    Malformed,
}

impl FrameKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Correlated => "correlated",
            Self::Welcome => "welcome",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Ticker => "ticker",
            Self::Other => "other",
            Self::Malformed => "malformed",
        }
    }
}

/// Why the supervisor is reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Handshake, connect or welcome failed.
    AttemptFailed,
    /// The socket closed without an operator request.
    Closed,
    /// The idle watchdog fired.
    Idle,
}

impl ReconnectReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AttemptFailed => "attempt_failed",
            Self::Closed => "closed",
            Self::Idle => "idle",
        }
    }
}

/// Count one inbound frame.
pub fn record_frame(kind: FrameKind) {
    counter!("ticker_relay_frames_received_total", "kind" => kind.as_str()).increment(1);
}

/// Count one relayed ticker.
pub fn record_ticker_relayed() {
    counter!("ticker_relay_tickers_relayed_total").increment(1);
}

/// Count one reconnect.
pub fn record_reconnect(reason: ReconnectReason) {
    counter!("ticker_relay_reconnects_total", "reason" => reason.as_str()).increment(1);
}

/// Count one missed pong.
pub fn record_missed_pong() {
    counter!("ticker_relay_missed_pongs_total").increment(1);
}

/// Count one subscription retry.
pub fn record_subscription_retry() {
    counter!("ticker_relay_subscription_retries_total").increment(1);
}

/// Set the exchange connection gauge.
pub fn set_exchange_connected(connected: bool) {
    gauge!("ticker_relay_exchange_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Set the prices room size.
#[allow(clippy::cast_precision_loss)]
pub fn set_relay_members(count: usize) {
    gauge!("ticker_relay_relay_members").set(count as f64);
}

/// Record bullet handshake latency.
pub fn record_handshake_duration(duration: Duration) {
    histogram!("ticker_relay_handshake_seconds").record(duration.as_secs_f64());
}
