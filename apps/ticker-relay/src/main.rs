//! Ticker Relay Binary
//!
//! Starts the KuCoin ticker relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ticker-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PORT`: HTTP and relay socket port
//!
//! ## Optional
//! - `APP_ENV`: development | production (default: development)
//! - `KUCOIN_OPENAPI_BASE_URL`: REST base URL (default: <https://api.kucoin.com>)
//! - `KUCOIN_BULLET_VERSION`: v1 | v2 | v3 (default: v1)
//! - `KUCOIN_API_KEY`, `KUCOIN_API_SECRET`, `KUCOIN_API_PASSPHRASE`: private channel credentials
//! - `RELAY_TICKER_TOPIC`: Exchange topic (default: /market/ticker:all)
//! - `HEALTH_PROBE_ENABLED`: Run the downstream probe (default: true)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ticker_relay::infrastructure::health::HealthServerState;
use ticker_relay::infrastructure::telemetry;
use ticker_relay::{
    BulletClient, ClientSettings, ConnectionStatus, DownstreamHealthService, EventBus,
    KucoinWsClient, LivenessProbe, RelayConfig, RelayGateway, RelayHub, RelayServer, Topic, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Grace period for the supervisor to tear down after shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting ticker relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let bullet = BulletClient::new(
        config.exchange.base_url.clone(),
        config.exchange.bullet_version,
        config.exchange.credentials.clone(),
    )
    .context("failed to build bullet client")?;

    let bus = Arc::new(EventBus::new());
    let client = Arc::new(KucoinWsClient::new(
        Arc::new(bullet),
        Arc::clone(&bus),
        ClientSettings::from_settings(&config.websocket),
        shutdown_token.child_token(),
    ));

    let topic = if client.is_private() {
        Topic::private(config.exchange.ticker_topic.clone())
    } else {
        Topic::public(config.exchange.ticker_topic.clone())
    };
    let hub = Arc::new(RelayHub::new(config.relay.room_capacity));
    let gateway = RelayGateway::attach(
        &client,
        Arc::clone(&hub),
        topic,
        config.exchange.exchange_id.clone(),
    );

    let probe = config.probe.enabled.then(|| {
        Arc::new(DownstreamHealthService::new(
            config.local_relay_url(),
            config.probe.clone(),
            shutdown_token.child_token(),
        ))
    });

    let exchange_status: Arc<dyn ConnectionStatus> = client.clone();
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        exchange_status,
        probe.clone().map(|probe| probe as Arc<dyn LivenessProbe>),
        Arc::clone(&hub),
    ));
    let server = RelayServer::new(
        config.server.port,
        health_state,
        Arc::clone(&hub),
        shutdown_token.clone(),
    );

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    if let Some(probe) = probe {
        tokio::spawn(probe.run());
    }

    let mut supervisor = tokio::spawn(Arc::clone(&client).run());

    tracing::info!("Ticker relay ready");

    let outcome = tokio::select! {
        () = await_shutdown() => {
            client.disconnect();
            shutdown_token.cancel();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut supervisor).await {
                Ok(joined) => joined.context("supervisor task failed")?.map_err(anyhow::Error::from),
                Err(_) => {
                    tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Supervisor did not stop in time");
                    Ok(())
                }
            }
        }
        joined = &mut supervisor => {
            shutdown_token.cancel();
            joined.context("supervisor task failed")?.map_err(anyhow::Error::from)
        }
    };

    gateway.detach();
    let _ = server_task.await;

    match &outcome {
        Ok(()) => tracing::info!("Ticker relay stopped"),
        Err(e) => tracing::error!(error = %e, "Ticker relay stopped with a fatal error"),
    }
    outcome
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        port = config.server.port,
        bullet_version = config.exchange.bullet_version.as_str(),
        private = config.exchange.credentials.is_some(),
        topic = %config.exchange.ticker_topic,
        probe = config.probe.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        base_url = %config.exchange.base_url,
        relay_url = %config.local_relay_url(),
        "Endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
