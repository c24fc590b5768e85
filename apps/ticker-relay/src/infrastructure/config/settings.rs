//! Relay Configuration Settings
//!
//! Configuration types for the ticker relay, loaded from environment
//! variables. Optional values that fail to parse fall back to their
//! defaults; only `PORT` is required.

use std::time::Duration;

use crate::domain::topic::ALL_TICKERS_TOPIC;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Production deployment.
    Production,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    /// Check if this is production.
    #[must_use]
    pub const fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Version segment of the bullet endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulletVersion {
    /// `/api/v1/bullet-*`
    #[default]
    V1,
    /// `/api/v2/bullet-*`
    V2,
    /// `/api/v3/bullet-*`
    V3,
}

impl BulletVersion {
    /// Parse from `v1`, `v2`, `v3` (or the bare digit).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().trim_start_matches(['v', 'V']) {
            "2" => Self::V2,
            "3" => Self::V3,
            _ => Self::V1,
        }
    }

    /// Path segment.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }
}

/// KuCoin API credentials for the private channel.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    passphrase: String,
    key_version: u8,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String, passphrase: String, key_version: u8) -> Self {
        Self {
            api_key,
            api_secret,
            passphrase,
            key_version,
        }
    }

    /// API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// API passphrase as configured.
    #[must_use]
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// Key version, `1` or `2`.
    #[must_use]
    pub const fn key_version(&self) -> u8 {
        self.key_version
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Exchange endpoint settings.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// REST base URL for the bullet handshake.
    pub base_url: String,
    /// Bullet endpoint version.
    pub bullet_version: BulletVersion,
    /// Private channel credentials, if configured.
    pub credentials: Option<Credentials>,
    /// Topic subscribed after each `ready`.
    pub ticker_topic: String,
    /// Exchange id stamped on relayed tickers.
    pub exchange_id: String,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.kucoin.com".to_string(),
            bullet_version: BulletVersion::V1,
            credentials: None,
            ticker_topic: ALL_TICKERS_TOPIC.to_string(),
            exchange_id: "kucoin".to_string(),
        }
    }
}

/// Exchange socket timing.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Delay between connect attempts, also the not-ready retry delay.
    pub reconnect_delay: Duration,
    /// Delay before re-sending a failed subscribe.
    pub subscription_retry_delay: Duration,
    /// Bound on welcome and pong waits.
    pub max_wait: Duration,
    /// Silence tolerated before the watchdog forces a reconnect.
    pub idle_timeout: Duration,
    /// Watchdog check interval.
    pub idle_check_interval: Duration,
    /// Retry budget per outage (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Growth factor between retries (1.0 = flat).
    pub reconnect_backoff: f64,
    /// Ceiling for grown retry delays.
    pub reconnect_max_delay: Duration,
    /// Fractional jitter on each retry delay.
    pub reconnect_jitter: f64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(1_000),
            subscription_retry_delay: Duration::from_millis(2_000),
            max_wait: Duration::from_millis(2_000),
            idle_timeout: Duration::from_millis(10_000),
            idle_check_interval: Duration::from_millis(1_000),
            max_reconnect_attempts: 0,
            reconnect_backoff: 1.0,
            reconnect_max_delay: Duration::from_millis(30_000),
            reconnect_jitter: 0.0,
        }
    }
}

/// Downstream health probe settings.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Whether the probe runs and gates `/health-check/ws`.
    pub enabled: bool,
    /// Interval between probe pings.
    pub ping_interval: Duration,
    /// Wait for each probe pong.
    pub pong_timeout: Duration,
    /// Unanswered pings tolerated before reporting unhealthy.
    pub max_ping_attempts: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval: Duration::from_millis(5_000),
            pong_timeout: Duration::from_millis(3_000),
            max_ping_attempts: 3,
        }
    }
}

/// Relay fan-out settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Prices room channel capacity.
    pub room_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            room_capacity: 1_024,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for health, metrics and the relay socket.
    pub port: u16,
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deployment environment.
    pub environment: Environment,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Exchange endpoint settings.
    pub exchange: ExchangeSettings,
    /// Exchange socket timing.
    pub websocket: WebSocketSettings,
    /// Downstream probe settings.
    pub probe: ProbeSettings,
    /// Relay fan-out settings.
    pub relay: RelaySettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PORT` is missing, empty or not a port number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `PORT` is missing, empty or not a port number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let port_raw = env.required("PORT")?;
        let port = port_raw
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "PORT".to_string(),
                value: port_raw.clone(),
            })?;

        let environment = env
            .get("APP_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let exchange_defaults = ExchangeSettings::default();
        let exchange = ExchangeSettings {
            base_url: env
                .get("KUCOIN_OPENAPI_BASE_URL")
                .unwrap_or(exchange_defaults.base_url),
            bullet_version: env
                .get("KUCOIN_BULLET_VERSION")
                .map(|s| BulletVersion::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            credentials: env.credentials(),
            ticker_topic: env
                .get("RELAY_TICKER_TOPIC")
                .unwrap_or(exchange_defaults.ticker_topic),
            exchange_id: env
                .get("RELAY_EXCHANGE_ID")
                .unwrap_or(exchange_defaults.exchange_id),
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            reconnect_delay: env.millis("MIDDLEWARE_WS_RECONNECT_TIMEOUT_MS", ws.reconnect_delay),
            subscription_retry_delay: env.millis(
                "RELAY_WS_SUBSCRIPTION_RETRY_MS",
                ws.subscription_retry_delay,
            ),
            max_wait: env.millis("RELAY_WS_MAX_WAIT_MS", ws.max_wait),
            idle_timeout: env.millis("RELAY_WS_IDLE_TIMEOUT_MS", ws.idle_timeout),
            idle_check_interval: env.period("RELAY_WS_IDLE_CHECK_MS", ws.idle_check_interval),
            max_reconnect_attempts: env
                .parsed("RELAY_WS_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(ws.max_reconnect_attempts),
            reconnect_backoff: env
                .parsed::<f64>("RELAY_WS_RECONNECT_BACKOFF")
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(ws.reconnect_backoff),
            reconnect_max_delay: env.millis("RELAY_WS_RECONNECT_MAX_DELAY_MS", ws.reconnect_max_delay),
            reconnect_jitter: env
                .parsed::<f64>("RELAY_WS_RECONNECT_JITTER")
                .filter(|j| (0.0..1.0).contains(j))
                .unwrap_or(ws.reconnect_jitter),
        };

        let pr = ProbeSettings::default();
        let probe = ProbeSettings {
            enabled: env.flag("HEALTH_PROBE_ENABLED").unwrap_or(pr.enabled),
            ping_interval: env.period("HEALTH_PROBE_PING_INTERVAL_MS", pr.ping_interval),
            pong_timeout: env.period("HEALTH_PROBE_PONG_TIMEOUT_MS", pr.pong_timeout),
            max_ping_attempts: env
                .parsed("HEALTH_PROBE_MAX_PING_ATTEMPTS")
                .unwrap_or(pr.max_ping_attempts),
        };

        let relay = RelaySettings {
            room_capacity: env
                .parsed::<usize>("RELAY_ROOM_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(RelaySettings::default().room_capacity),
        };

        Ok(Self {
            environment,
            server: ServerSettings { port },
            exchange,
            websocket,
            probe,
            relay,
        })
    }

    /// URL of the relay socket on this process, used by the probe.
    #[must_use]
    pub fn local_relay_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.server.port)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_millis)
    }

    /// Like [`Self::millis`], but zero falls back to `default`; timer periods must be non-zero.
    fn period(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key)
            .filter(|ms| *ms > 0)
            .map_or(default, Duration::from_millis)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)?.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        let key = self.get("KUCOIN_API_KEY")?;
        let secret = self.get("KUCOIN_API_SECRET")?;
        let passphrase = self.get("KUCOIN_API_PASSPHRASE")?;
        let version = self
            .parsed::<u8>("KUCOIN_API_KEY_VERSION")
            .filter(|v| matches!(v, 1 | 2))
            .unwrap_or(2);
        Some(Credentials::new(key, secret, passphrase, version))
    }
}
