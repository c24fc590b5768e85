//! Correlation Table
//!
//! Tracks frames we are waiting for, keyed by `(type, id)`. A waiter is
//! resolved either by the dispatcher (matching frame) or by its own timer,
//! whichever removes the table entry first. The entry is removed exactly
//! once, so resolution is at most once.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Composite key of a pending wait.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Expected frame type (`welcome`, `pong`, `ack`).
    pub kind: String,
    /// Expected frame id.
    pub id: String,
}

impl CorrelationKey {
    /// Build a key.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Matching frame arrived.
    Resolved,
    /// Timer fired first.
    TimedOut,
    /// The owning connection was torn down.
    Cancelled,
}

impl WaitOutcome {
    /// Whether the frame arrived.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// Map of in-flight waits.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationKey, oneshot::Sender<WaitOutcome>>>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `key`.
    ///
    /// Registering a key that is already pending cancels the earlier waiter.
    pub fn register(&self, key: CorrelationKey) -> PendingWait<'_> {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().insert(key.clone(), tx) {
            let _ = previous.send(WaitOutcome::Cancelled);
        }
        PendingWait {
            table: self,
            key,
            rx,
        }
    }

    /// Resolve the waiter for `key`. Returns `false` if nothing was pending.
    pub fn resolve(&self, key: &CorrelationKey) -> bool {
        // Send under the lock so an expiring waiter always observes it.
        let mut pending = self.pending.lock();
        pending.remove(key).is_some_and(|tx| {
            let _ = tx.send(WaitOutcome::Resolved);
            true
        })
    }

    #[cfg(test)]
    fn contains(&self, key: &CorrelationKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of pending waits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Cancel every pending wait.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (_, tx) in pending.drain() {
            let _ = tx.send(WaitOutcome::Cancelled);
        }
        count
    }

    fn expire(&self, key: &CorrelationKey) -> bool {
        self.pending.lock().remove(key).is_some()
    }
}

/// A registered wait.
///
/// Dropping it without calling [`PendingWait::wait`] removes the entry.
#[derive(Debug)]
pub struct PendingWait<'a> {
    table: &'a CorrelationTable,
    key: CorrelationKey,
    rx: oneshot::Receiver<WaitOutcome>,
}

impl PendingWait<'_> {
    /// Wait up to `timeout` for the matching frame.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => {
                if self.table.expire(&self.key) {
                    WaitOutcome::TimedOut
                } else {
                    // The resolver removed the entry first and already sent.
                    self.rx.try_recv().unwrap_or(WaitOutcome::Cancelled)
                }
            }
        }
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        // Only drop our own sender: a re-registration may own the slot now.
        self.rx.close();
        let mut pending = self.table.pending.lock();
        if pending.get(&self.key).is_some_and(oneshot::Sender::is_closed) {
            pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn resolve_before_timeout() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new("welcome", "abc");
        let wait = table.register(key.clone());

        assert!(table.resolve(&key));
        assert_eq!(wait.wait(Duration::from_secs(1)).await, WaitOutcome::Resolved);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new("pong", "ping-1");
        let wait = table.register(key.clone());

        assert_eq!(
            wait.wait(Duration::from_millis(50)).await,
            WaitOutcome::TimedOut
        );
        assert!(!table.contains(&key));
        // A late frame finds nothing to resolve.
        assert!(!table.resolve(&key));
    }

    #[tokio::test]
    async fn resolve_unknown_key_is_noop() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&CorrelationKey::new("pong", "nope")));
    }

    #[tokio::test]
    async fn cancel_all_wakes_waiters() {
        let table = Arc::new(CorrelationTable::new());
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                table
                    .register(CorrelationKey::new("welcome", "x"))
                    .wait(Duration::from_secs(30))
                    .await
            })
        };
        while table.is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(table.cancel_all(), 1);
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn dropped_wait_releases_entry() {
        let table = CorrelationTable::new();
        {
            let _wait = table.register(CorrelationKey::new("pong", "1"));
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reregistering_cancels_previous_waiter() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new("pong", "dup");
        let first = table.register(key.clone());
        let second = table.register(key.clone());

        assert_eq!(first.wait(Duration::from_secs(1)).await, WaitOutcome::Cancelled);
        assert!(table.resolve(&key));
        assert_eq!(second.wait(Duration::from_secs(1)).await, WaitOutcome::Resolved);
    }

    #[test]
    fn key_display() {
        assert_eq!(CorrelationKey::new("pong", "7").to_string(), "pong-7");
    }
}
