//! Subscription Manager
//!
//! Sends subscribe and unsubscribe control frames. Subscribing never fails
//! the caller: while the socket is not open the request waits, and a failed
//! send is retried on a fixed delay until it succeeds or the client stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::messages::ControlFrame;
use super::session::SocketSlot;
use crate::application::services::EventBus;
use crate::domain::events::{ClientEvent, EventPayload, SubscriptionNotice, names};
use crate::domain::topic::Topic;
use crate::infrastructure::metrics;

/// Subscription timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// Wait between checks while the socket is not open.
    pub not_ready_delay: Duration,
    /// Wait before re-sending after a failed send.
    pub retry_delay: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            not_ready_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Topic subscription with retry-until-ready semantics.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    slot: Arc<SocketSlot>,
    bus: Arc<EventBus>,
    settings: SubscriptionSettings,
    cancel: CancellationToken,
}

impl SubscriptionManager {
    /// Build a manager. `cancel` should be the client's token.
    #[must_use]
    pub const fn new(
        slot: Arc<SocketSlot>,
        bus: Arc<EventBus>,
        settings: SubscriptionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot,
            bus,
            settings,
            cancel,
        }
    }

    /// Subscribe in the background.
    pub fn subscribe_to(&self, topic: Topic) -> JoinHandle<bool> {
        let manager = self.clone();
        tokio::spawn(async move { manager.subscribe(&topic).await })
    }

    /// Subscribe, waiting and retrying as needed.
    ///
    /// Returns `true` once the frame was sent, `false` if the client stopped
    /// first.
    pub async fn subscribe(&self, topic: &Topic) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            if !self.slot.is_open() {
                tracing::debug!(topic = %topic, "Socket not ready, deferring subscription");
                self.notify(names::SOCKET_NOT_READY, topic, "socket is not open yet");
                if !self.pause(self.settings.not_ready_delay).await {
                    return false;
                }
                continue;
            }

            let id = uuid::Uuid::new_v4().to_string();
            match self.slot.send_frame(&ControlFrame::subscribe(id, topic)).await {
                Ok(()) => {
                    tracing::info!(topic = %topic, "Subscribed");
                    self.notify(names::SUBSCRIPTION, topic, "subscribed");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Subscribe failed, will retry");
                    self.bus.emit(&ClientEvent::error(&e));
                    if !self.pause(self.settings.retry_delay).await {
                        return false;
                    }
                    metrics::record_subscription_retry();
                    self.notify(names::RETRY_SUBSCRIPTION, topic, "retrying subscription");
                }
            }
        }
    }

    /// One best-effort unsubscribe. Does nothing unless the socket is open.
    ///
    /// Returns whether the frame was sent.
    pub async fn unsubscribe_from(&self, topic: &Topic) -> bool {
        if !self.slot.is_open() {
            return false;
        }
        let id = uuid::Uuid::new_v4().to_string();
        match self
            .slot
            .send_frame(&ControlFrame::unsubscribe(id, topic))
            .await
        {
            Ok(()) => {
                tracing::info!(topic = %topic, "Unsubscribed");
                self.notify(names::UNSUBSCRIPTION, topic, "unsubscribed");
                true
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Unsubscribe failed");
                self.bus.emit(&ClientEvent::error(&e));
                false
            }
        }
    }

    fn notify(&self, event: &str, topic: &Topic, message: &str) {
        self.bus.emit(&ClientEvent::new(
            event,
            EventPayload::Subscription(SubscriptionNotice {
                topic: topic.name().to_string(),
                message: message.to_string(),
            }),
        ));
    }

    /// Sleep unless cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
