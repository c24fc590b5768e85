//! Bullet Handshake
//!
//! KuCoin hands out short-lived WebSocket tokens from
//! `POST {base}/api/{version}/bullet-{public|private}`. The private variant
//! is signed with the account's API key.
//!
//! The token and a fresh connect id are appended to the first instance
//! server's endpoint to form the socket URL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;

use crate::application::ports::{HandshakeError, TokenProvider};
use crate::domain::connection::ConnectionToken;
use crate::infrastructure::config::{BulletVersion, Credentials};
use crate::infrastructure::metrics;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct BulletResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletData {
    #[serde(default)]
    token: String,
    #[serde(default)]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceServer {
    endpoint: String,
    #[serde(default)]
    ping_interval: u64,
    #[serde(default)]
    ping_timeout: u64,
}

/// HTTP client for the bullet endpoint.
#[derive(Debug, Clone)]
pub struct BulletClient {
    http: reqwest::Client,
    base_url: String,
    version: BulletVersion,
    credentials: Option<Credentials>,
}

impl BulletClient {
    /// Build a client. Credentials select the private channel.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        version: BulletVersion,
        credentials: Option<Credentials>,
    ) -> Result<Self, HandshakeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HandshakeError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version,
            credentials,
        })
    }

    /// Request path, e.g. `/api/v1/bullet-public`.
    #[must_use]
    pub fn path(&self) -> String {
        let channel = if self.credentials.is_some() {
            "private"
        } else {
            "public"
        };
        format!("/api/{}/bullet-{channel}", self.version.as_str())
    }

    async fn request(&self) -> Result<ConnectionToken, HandshakeError> {
        let path = self.path();
        let mut request = self.http.post(format!("{}{path}", self.base_url));

        if let Some(creds) = &self.credentials {
            let timestamp = chrono::Utc::now().timestamp_millis().to_string();
            for (name, value) in sign_headers(creds, &timestamp, "POST", &path, "")? {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandshakeError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HandshakeError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(HandshakeError::Status {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        parse_bullet(&body)
    }
}

#[async_trait]
impl TokenProvider for BulletClient {
    async fn fetch_token(&self) -> Result<ConnectionToken, HandshakeError> {
        let started = Instant::now();
        let result = self.request().await;
        metrics::record_handshake_duration(started.elapsed());
        match &result {
            Ok(token) => tracing::debug!(endpoint = %token.endpoint, "Bullet token obtained"),
            Err(e) => tracing::warn!(error = %e, "Bullet handshake failed"),
        }
        result
    }

    fn is_private(&self) -> bool {
        self.credentials.is_some()
    }
}

fn parse_bullet(body: &str) -> Result<ConnectionToken, HandshakeError> {
    let response: BulletResponse =
        serde_json::from_str(body).map_err(|e| HandshakeError::InvalidResponse(e.to_string()))?;

    let Some(data) = response.data else {
        let reason = response
            .msg
            .or(response.code)
            .unwrap_or_else(|| "missing data".to_string());
        return Err(HandshakeError::InvalidResponse(reason));
    };
    if data.token.is_empty() {
        return Err(HandshakeError::MissingToken);
    }
    let server = data
        .instance_servers
        .into_iter()
        .next()
        .ok_or(HandshakeError::NoInstanceServers)?;

    Ok(ConnectionToken {
        token: data.token,
        endpoint: server.endpoint,
        ping_interval: Duration::from_millis(server.ping_interval),
        ping_timeout: Duration::from_millis(server.ping_timeout),
    })
}

fn hmac_base64(secret: &str, payload: &str) -> Result<String, HandshakeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HandshakeError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// KuCoin authentication headers for one request.
///
/// # Errors
///
/// Returns [`HandshakeError::Signing`] if the HMAC key is rejected.
pub fn sign_headers(
    creds: &Credentials,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<Vec<(&'static str, String)>, HandshakeError> {
    let signature = hmac_base64(
        creds.api_secret(),
        &format!("{timestamp}{method}{path}{body}"),
    )?;
    let passphrase = if creds.key_version() >= 2 {
        hmac_base64(creds.api_secret(), creds.passphrase())?
    } else {
        creds.passphrase().to_string()
    };
    Ok(vec![
        ("KC-API-KEY", creds.api_key().to_string()),
        ("KC-API-SIGN", signature),
        ("KC-API-TIMESTAMP", timestamp.to_string()),
        ("KC-API-PASSPHRASE", passphrase),
        ("KC-API-KEY-VERSION", creds.key_version().to_string()),
    ])
}

/// 24 random bytes, hex encoded.
#[must_use]
pub fn new_connect_id() -> String {
    let mut bytes = [0_u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Socket URL for `token` with `token` and `connectId` query parameters.
#[must_use]
pub fn build_socket_url(token: &ConnectionToken, connect_id: &str) -> String {
    let separator = if token.endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{}{separator}token={}&connectId={connect_id}",
        token.endpoint, token.token
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn bullet_body() -> serde_json::Value {
        json!({
            "code": "200000",
            "data": {
                "token": "t1",
                "instanceServers": [
                    { "endpoint": "wss://x", "pingInterval": 5000, "pingTimeout": 10000,
                      "protocol": "websocket", "encrypt": true },
                    { "endpoint": "wss://y", "pingInterval": 1, "pingTimeout": 1 }
                ]
            }
        })
    }

    #[tokio::test]
    async fn public_handshake_uses_first_instance_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/bullet-public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bullet_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = BulletClient::new(server.uri(), BulletVersion::V1, None).unwrap();
        let token = client.fetch_token().await.unwrap();

        assert!(!client.is_private());
        assert_eq!(token.token, "t1");
        assert_eq!(token.endpoint, "wss://x");
        assert_eq!(token.ping_interval, Duration::from_secs(5));
        assert_eq!(token.ping_timeout, Duration::from_secs(10));

        let connect_id = new_connect_id();
        assert_eq!(
            build_socket_url(&token, &connect_id),
            format!("wss://x?token=t1&connectId={connect_id}")
        );
    }

    #[tokio::test]
    async fn private_handshake_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/bullet-private"))
            .and(header_exists("KC-API-SIGN"))
            .and(header_exists("KC-API-PASSPHRASE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bullet_body()))
            .expect(1)
            .mount(&server)
            .await;

        let creds = Credentials::new("k".into(), "s".into(), "p".into(), 2);
        let client = BulletClient::new(server.uri(), BulletVersion::V2, Some(creds)).unwrap();

        assert!(client.is_private());
        assert_eq!(client.fetch_token().await.unwrap().token, "t1");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = BulletClient::new(server.uri(), BulletVersion::V1, None).unwrap();
        assert_eq!(
            client.fetch_token().await,
            Err(HandshakeError::Status {
                status: 503,
                body: "maintenance".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let client = BulletClient::new("http://127.0.0.1:1", BulletVersion::V1, None).unwrap();
        assert!(matches!(
            client.fetch_token().await,
            Err(HandshakeError::Network(_))
        ));
    }

    #[test]
    fn body_validation() {
        assert!(matches!(
            parse_bullet("<html>"),
            Err(HandshakeError::InvalidResponse(_))
        ));
        assert_eq!(
            parse_bullet(r#"{"code":"200000","data":{"token":"","instanceServers":[]}}"#),
            Err(HandshakeError::MissingToken)
        );
        assert_eq!(
            parse_bullet(r#"{"code":"200000","data":{"token":"t","instanceServers":[]}}"#),
            Err(HandshakeError::NoInstanceServers)
        );
        assert_eq!(
            parse_bullet(r#"{"code":"400003","msg":"KC-API-KEY not exists"}"#),
            Err(HandshakeError::InvalidResponse(
                "KC-API-KEY not exists".to_string()
            ))
        );
    }

    #[test]
    fn connect_id_is_48_hex_chars() {
        let id = new_connect_id();
        assert_eq!(id.len(), 48);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_connect_id());
    }

    #[test]
    fn signature_matches_known_vector() {
        let creds = Credentials::new("key".into(), "secret".into(), "pass".into(), 2);
        let headers = sign_headers(&creds, "1700000000000", "POST", "/api/v1/bullet-private", "")
            .unwrap();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(
            get("KC-API-SIGN"),
            hmac_base64("secret", "1700000000000POST/api/v1/bullet-private").unwrap()
        );
        assert_eq!(get("KC-API-PASSPHRASE"), hmac_base64("secret", "pass").unwrap());
        assert_eq!(get("KC-API-KEY-VERSION"), "2");

        let v1 = Credentials::new("key".into(), "secret".into(), "pass".into(), 1);
        let headers = sign_headers(&v1, "1", "POST", "/x", "").unwrap();
        assert!(headers.contains(&("KC-API-PASSPHRASE", "pass".to_string())));
    }
}
