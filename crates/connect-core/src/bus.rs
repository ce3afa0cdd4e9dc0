//! Status bus
//!
//! Fan-out of status notifications to the external API layer.
//!
//! ## Delivery semantics
//!
//! - Each subscriber owns a bounded queue; events arrive in publish order
//! - `publish` never blocks: when a subscriber's queue is full the event is
//!   dropped for that subscriber only (logged)
//! - Subscribers whose receiver was dropped are pruned on the next publish

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::RemoteAccessType;
use crate::connection::ConnectionStatus;
use crate::state::RemoteAccessStatus;
use crate::traits::AccessUrl;

/// Notifications published by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Relay connection status changed
    ConnectionChanged(ConnectionStatus),

    /// A backend opened remote access
    AccessEnabled {
        /// Backend type
        kind: RemoteAccessType,
        /// URL remote clients should use
        url: Option<AccessUrl>,
    },

    /// A backend closed remote access
    AccessDisabled {
        /// Backend type
        kind: RemoteAccessType,
    },

    /// The relay rejected the stored credential
    CredentialInvalid,

    /// Remote access status surface changed
    RuntimeChanged(RemoteAccessStatus),
}

/// Bounded multi-subscriber status channel
#[derive(Clone)]
pub struct StatusBus {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<StatusEvent>>>>,
}

impl StatusBus {
    /// Create a bus whose subscriber queues hold `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        rx
    }

    /// Publish an event to every subscriber
    pub fn publish(&self, event: StatusEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Status subscriber queue full, dropping event. Subscriber is not keeping up."
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<StatusEvent>>> {
        // A poisoned list is still a valid list of senders
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = StatusBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(StatusEvent::CredentialInvalid);
        bus.publish(StatusEvent::AccessDisabled {
            kind: RemoteAccessType::Upnp,
        });

        assert_eq!(rx.recv().await, Some(StatusEvent::CredentialInvalid));
        assert_eq!(
            rx.recv().await,
            Some(StatusEvent::AccessDisabled {
                kind: RemoteAccessType::Upnp
            })
        );
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking_others() {
        let bus = StatusBus::new(1);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(StatusEvent::CredentialInvalid);
        assert_eq!(fast.recv().await, Some(StatusEvent::CredentialInvalid));

        bus.publish(StatusEvent::AccessDisabled {
            kind: RemoteAccessType::Static,
        });

        assert_eq!(slow.recv().await, Some(StatusEvent::CredentialInvalid));
        assert!(slow.try_recv().is_err());
        assert!(fast.try_recv().is_ok());
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = StatusBus::new(4);
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);

        bus.publish(StatusEvent::CredentialInvalid);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
