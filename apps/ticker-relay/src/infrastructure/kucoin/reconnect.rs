//! Reconnect Policy
//!
//! Decides how long the supervisor sleeps between connection attempts.
//! The exchange recommends a flat delay, so the default policy does not
//! grow; a multiplier and jitter are available for deployments that want
//! to back off harder.

use std::time::Duration;

use rand::Rng;

use crate::WebSocketSettings;

/// Tunables for [`ReconnectPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for grown delays.
    pub max_delay: Duration,
    /// Growth factor applied after each retry. `1.0` keeps the delay flat.
    pub multiplier: f64,
    /// Fractional jitter, e.g. `0.1` for ±10%.
    pub jitter: f64,
    /// Retry budget per outage. `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1), 0)
    }
}

impl ReconnectConfig {
    /// Flat delay with no jitter.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    /// Derive from the websocket settings.
    #[must_use]
    pub const fn from_settings(settings: &WebSocketSettings) -> Self {
        Self::fixed(settings.reconnect_delay, settings.max_reconnect_attempts)
            .with_backoff(settings.reconnect_backoff, settings.reconnect_max_delay)
            .with_jitter(settings.reconnect_jitter)
    }

    /// Grow the delay by `multiplier` up to `max_delay`.
    #[must_use]
    pub const fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Randomise each delay by ±`jitter`.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Retry bookkeeping for one outage.
///
/// The supervisor calls [`ReconnectPolicy::next_delay`] after every failed or
/// lost connection and [`ReconnectPolicy::reset`] once a session reaches
/// `open`.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// New policy with a fresh budget.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current = config.base_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempts += 1;
        let delay = self.jittered(self.current);
        self.current = self.grown(self.current);
        Some(delay)
    }

    /// Restore the base delay and the full budget.
    pub const fn reset(&mut self) {
        self.current = self.config.base_delay;
        self.attempts = 0;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    /// The configured budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn grown(&self, delay: Duration) -> Duration {
        if self.config.multiplier <= 1.0 {
            return delay;
        }
        let next = delay.mul_f64(self.config.multiplier);
        next.min(self.config.max_delay.max(self.config.base_delay))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.config.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor).max(Duration::from_millis(1))
    }
}
