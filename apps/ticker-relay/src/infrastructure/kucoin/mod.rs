//! KuCoin WebSocket adapter.
//!
//! The connection core: bullet handshake, supervised socket with
//! reconnect, heartbeat, idle watchdog, subscriptions and frame dispatch.

pub mod bullet;
pub mod client;
pub mod correlation;
pub mod dispatcher;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod subscription;
pub mod watchdog;

pub use bullet::BulletClient;
pub use client::{AttemptError, ClientError, ClientSettings, KucoinWsClient};
pub use session::SendFailure;
