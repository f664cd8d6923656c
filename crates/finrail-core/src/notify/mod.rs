//! Outbound notification capability.
//!
//! The core emits a [`CoreNotification`] whenever observable state changes:
//! a lock is acquired or released, a circuit transitions, or an event is
//! appended. The core knows nothing about transport; an adapter outside this
//! crate subscribes to a [`BroadcastNotifier`] and forwards notifications to
//! dashboards or socket clients. Sends are fire-and-forget: a slow or absent
//! subscriber never affects the operation that produced the notification.

use serde::Serialize;
use tokio::sync::broadcast;

#[cfg(test)]
mod tests;

/// A state-change notification emitted by the core.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CoreNotification {
    /// A distributed lock was acquired.
    LockAcquired {
        /// Resource key the lock covers.
        resource: String,
        /// Token identifying this acquisition.
        token: String,
        /// Requested time-to-live in milliseconds.
        ttl_ms: u64,
    },

    /// A distributed lock was released by its holder.
    LockReleased {
        /// Resource key the lock covered.
        resource: String,
        /// Token that held the lock.
        token: String,
    },

    /// A circuit breaker changed state.
    CircuitTransition {
        /// Service the circuit guards.
        service: String,
        /// State before the transition.
        previous: String,
        /// State after the transition.
        current: String,
        /// Failure count at the time of the transition.
        failure_count: u32,
    },

    /// A financial event was durably appended.
    EventAppended {
        /// Identifier of the stored event.
        event_id: String,
        /// Canonical event type string.
        event_type: String,
        /// Aggregate type the event belongs to.
        aggregate_type: String,
        /// Aggregate id the event belongs to.
        aggregate_id: String,
        /// Version assigned within the aggregate's stream.
        version: u64,
    },
}

/// Sink for core notifications.
///
/// Implementations must never block or fail the caller.
pub trait Notifier: Send + Sync {
    /// Delivers one notification. Delivery is best-effort.
    fn notify(&self, notification: CoreNotification);
}

/// Fan-out notifier over a Tokio broadcast channel.
///
/// Subscribers that fall behind lose old notifications rather than slowing
/// the core down.
#[derive(Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<CoreNotification>,
}

impl BroadcastNotifier {
    /// Creates a notifier buffering up to `capacity` notifications per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Opens a new subscription. Each subscriber sees every notification
    /// sent after it subscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreNotification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: CoreNotification) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(notification);
    }
}

/// Notifier that drops everything, for tests and headless deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: CoreNotification) {}
}
