//! Exchange-to-Relay Integration Tests
//!
//! Runs the client against a wiremock bullet endpoint and an in-process
//! WebSocket server standing in for the exchange.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ticker_relay::infrastructure::kucoin::reconnect::ReconnectConfig;
use ticker_relay::infrastructure::kucoin::subscription::SubscriptionSettings;
use ticker_relay::infrastructure::kucoin::watchdog::WatchdogConfig;
use ticker_relay::infrastructure::relay::relay_router;
use ticker_relay::{
    BulletClient, BulletVersion, ClientSettings, ConnectionState, Envelope, EventBus,
    KucoinWsClient, RelayGateway, RelayHub, Topic,
};

const TICKER_FRAME: &str = r#"{"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{"price":"50000","bestBid":"49999"}}"#;

/// How the fake exchange treats each accepted socket.
#[derive(Clone, Copy)]
enum Exchange {
    /// Welcome, ack subscriptions, then stream tickers.
    Streaming,
    /// Accept and stay silent.
    Silent,
    /// Welcome and answer control frames, but never send a ticker.
    StallAfterWelcome,
    /// Welcome, ack the first subscription, then close the socket.
    CloseAfterSubscribe,
}

impl Exchange {
    const fn welcomes(self) -> bool {
        !matches!(self, Self::Silent)
    }

    const fn streams(self) -> bool {
        matches!(self, Self::Streaming)
    }
}

/// Start a fake exchange. Every text frame it receives is forwarded to the
/// returned channel.
async fn fake_exchange(mode: Exchange) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/endpoint", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let connect_id = Arc::new(Mutex::new(None));
                let captured = Arc::clone(&connect_id);
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *captured.lock() = query_param(req.uri().query().unwrap_or_default(), "connectId");
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let (mut sink, mut frames) = ws.split();

                if mode.welcomes() {
                    let id = connect_id.lock().clone().unwrap_or_default();
                    let welcome = json!({ "id": id, "type": "welcome" }).to_string();
                    if sink.send(Message::Text(welcome.into())).await.is_err() {
                        return;
                    }
                }

                let mut tickers = tokio::time::interval(Duration::from_millis(20));
                let mut subscribed = false;
                loop {
                    tokio::select! {
                        frame = frames.next() => {
                            let Some(Ok(Message::Text(text))) = frame else { break };
                            let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                            let reply = match value["type"].as_str() {
                                Some("subscribe") => {
                                    subscribed = true;
                                    Some(json!({ "id": value["id"], "type": "ack" }))
                                }
                                Some("ping") => Some(json!({ "id": value["id"], "type": "pong" })),
                                _ => None,
                            };
                            let _ = seen.send(value);
                            if let Some(reply) = reply
                                && mode.welcomes()
                                && sink.send(Message::Text(reply.to_string().into())).await.is_err()
                            {
                                break;
                            }
                            if subscribed && matches!(mode, Exchange::CloseAfterSubscribe) {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        _ = tickers.tick(), if subscribed && mode.streams() => {
                            if sink.send(Message::Text(TICKER_FRAME.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (url, seen_rx)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

async fn bullet_server(endpoint: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/bullet-public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "200000",
            "data": {
                "token": "t1",
                "instanceServers": [{
                    "endpoint": endpoint,
                    "pingInterval": 18000,
                    "pingTimeout": 10000,
                    "protocol": "websocket",
                    "encrypt": true
                }]
            }
        })))
        .mount(&server)
        .await;
    server
}

fn fast_settings() -> ClientSettings {
    ClientSettings {
        reconnect: ReconnectConfig::fixed(Duration::from_millis(100), 0),
        max_wait: Duration::from_millis(300),
        subscription: SubscriptionSettings {
            not_ready_delay: Duration::from_millis(50),
            retry_delay: Duration::from_millis(100),
        },
        watchdog: WatchdogConfig {
            check_interval: Duration::from_millis(100),
            idle_threshold: Duration::from_secs(5),
        },
    }
}

fn client(bullet_url: &str, bus: Arc<EventBus>) -> Arc<KucoinWsClient> {
    client_with(bullet_url, bus, fast_settings())
}

fn client_with(bullet_url: &str, bus: Arc<EventBus>, settings: ClientSettings) -> Arc<KucoinWsClient> {
    let bullet = BulletClient::new(bullet_url, BulletVersion::V1, None).unwrap();
    Arc::new(KucoinWsClient::new(
        Arc::new(bullet),
        bus,
        settings,
        CancellationToken::new(),
    ))
}

/// Record every event name emitted on `bus`, in order.
fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on_any(move |event| sink.lock().push(event.event.clone()));
    events
}

/// Whether `wanted` appears in `events` in order, gaps allowed.
fn in_order(events: &[String], wanted: &[&str]) -> bool {
    let mut rest = events.iter();
    wanted.iter().all(|name| rest.any(|event| event == name))
}

/// Wait until the bullet endpoint has seen `count` handshakes.
async fn handshakes_reach(bullet: &MockServer, count: usize) -> usize {
    timeout(Duration::from_secs(5), async {
        loop {
            let seen = bullet.received_requests().await.map_or(0, |r| r.len());
            if seen >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("handshakes within deadline")
}

/// Wait until the recorded events contain `wanted` in order.
async fn events_reach(events: &Mutex<Vec<String>>, wanted: &[&str]) {
    timeout(Duration::from_secs(5), async {
        while !in_order(&events.lock(), wanted) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("events {:?} never reached {wanted:?}", events.lock()));
}

async fn next_frame_of(seen: &mut mpsc::UnboundedReceiver<Value>, kind: &str) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(3), seen.recv())
            .await
            .expect("frame within deadline")
            .expect("exchange still running");
        if frame["type"] == kind {
            return frame;
        }
    }
}

#[tokio::test]
async fn tickers_reach_relay_members() {
    let (endpoint, mut seen) = fake_exchange(Exchange::Streaming).await;
    let bullet = bullet_server(&endpoint).await;
    let bus = Arc::new(EventBus::new());
    let client = client(&bullet.uri(), Arc::clone(&bus));

    let hub = Arc::new(RelayHub::new(64));
    let _gateway = RelayGateway::attach(
        &client,
        Arc::clone(&hub),
        Topic::public("/market/ticker:all"),
        "kucoin",
    );
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_url = format!("ws://{}/ws", relay.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(relay, relay_router(hub)).await });

    let supervisor = tokio::spawn(Arc::clone(&client).run());

    let subscribe = next_frame_of(&mut seen, "subscribe").await;
    assert_eq!(subscribe["topic"], "/market/ticker:all");
    assert_eq!(subscribe["response"], true);
    assert_eq!(client.state(), ConnectionState::Open);

    let (mut member, _) = tokio_tungstenite::connect_async(relay_url.as_str()).await.unwrap();
    member
        .send(Message::Text(Envelope::join_prices().to_text().into()))
        .await
        .unwrap();

    let update = timeout(Duration::from_secs(3), async {
        loop {
            if let Some(Ok(Message::Text(text))) = member.next().await {
                let envelope = Envelope::parse(text.as_str()).unwrap();
                if envelope.event == "update-prices" {
                    return envelope;
                }
            }
        }
    })
    .await
    .expect("update within deadline");

    let data: Value = serde_json::from_str(update.data.as_str().unwrap()).unwrap();
    assert_eq!(
        data,
        json!({
            "tokenPrice": { "pair": "BTC-USDT", "priceNumber": "50000" },
            "exchange": "kucoin"
        })
    );

    client.disconnect();
    let result = timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn missing_welcome_triggers_fresh_handshake() {
    let (endpoint, _seen) = fake_exchange(Exchange::Silent).await;
    let bullet = bullet_server(&endpoint).await;
    let bus = Arc::new(EventBus::new());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    bus.on("error", move |event| sink.lock().push(event.clone()));
    let client = client(&bullet.uri(), Arc::clone(&bus));

    let supervisor = tokio::spawn(Arc::clone(&client).run());

    let handshakes = timeout(Duration::from_secs(3), async {
        loop {
            let count = bullet.received_requests().await.map_or(0, |r| r.len());
            if count >= 2 {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("second handshake within deadline");

    assert!(handshakes >= 2);
    assert!(!errors.lock().is_empty());
    assert_ne!(client.state(), ConnectionState::Open);

    client.disconnect();
    assert!(timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn subscription_requested_before_open_is_sent_once_ready() {
    let (endpoint, mut seen) = fake_exchange(Exchange::Streaming).await;
    let bullet = bullet_server(&endpoint).await;
    let bus = Arc::new(EventBus::new());
    let not_ready = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&not_ready);
    bus.on("socket-not-ready", move |_| *counter.lock() += 1);
    let client = client(&bullet.uri(), Arc::clone(&bus));

    let pending = client.subscribe_to(Topic::public("/market/ticker:ETH-USDT"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(*not_ready.lock() >= 1);

    let supervisor = tokio::spawn(Arc::clone(&client).run());

    let subscribe = next_frame_of(&mut seen, "subscribe").await;
    assert_eq!(subscribe["topic"], "/market/ticker:ETH-USDT");
    assert!(timeout(Duration::from_secs(1), pending).await.unwrap().unwrap());

    client.disconnect();
    assert!(timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn rejected_handshake_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/bullet-public"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let bus = Arc::new(EventBus::new());
    let client = client(&server.uri(), bus);

    let supervisor = tokio::spawn(Arc::clone(&client).run());
    tokio::time::sleep(Duration::from_millis(350)).await;

    let attempts = server.received_requests().await.map_or(0, |r| r.len());
    assert!(attempts >= 2, "expected retries, saw {attempts}");

    client.disconnect();
    assert!(timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn idle_stall_triggers_fresh_handshake() {
    let (endpoint, _seen) = fake_exchange(Exchange::StallAfterWelcome).await;
    let bullet = bullet_server(&endpoint).await;
    let bus = Arc::new(EventBus::new());
    let events = record_events(&bus);
    let settings = ClientSettings {
        watchdog: WatchdogConfig {
            check_interval: Duration::from_millis(50),
            idle_threshold: Duration::from_millis(300),
        },
        ..fast_settings()
    };
    let client = client_with(&bullet.uri(), Arc::clone(&bus), settings);

    let supervisor = tokio::spawn(Arc::clone(&client).run());

    events_reach(&events, &["open", "ready", "close", "reconnect", "open"]).await;
    assert!(handshakes_reach(&bullet, 2).await >= 2);

    client.disconnect();
    assert!(timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let (endpoint, mut seen) = fake_exchange(Exchange::CloseAfterSubscribe).await;
    let bullet = bullet_server(&endpoint).await;
    let bus = Arc::new(EventBus::new());
    let events = record_events(&bus);
    let client = client(&bullet.uri(), Arc::clone(&bus));
    let _gateway = RelayGateway::attach(
        &client,
        Arc::new(RelayHub::new(8)),
        Topic::public("/market/ticker:all"),
        "kucoin",
    );

    let supervisor = tokio::spawn(Arc::clone(&client).run());

    next_frame_of(&mut seen, "subscribe").await;
    events_reach(&events, &["open", "ready", "close", "reconnect", "open"]).await;
    assert!(handshakes_reach(&bullet, 2).await >= 2);

    client.disconnect();
    assert!(timeout(Duration::from_secs(2), supervisor).await.unwrap().unwrap().is_ok());
}
