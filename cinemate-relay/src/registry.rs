//! Destination registry: the shared mutable state of the relay
//!
//! Maps destination strings to the set of subscribed connections, plus a
//! reverse index per connection for cleanup. Destinations are not
//! persisted entities; a key exists only while at least one subscription
//! references it and is removed as soon as its subscriber set empties.
//!
//! All mutations are atomic per destination key via `DashMap` entry
//! locking. Lock order is always connection index first, destination map
//! second.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cinemate_core::models::ConnectionId;

use crate::dispatcher::Delivery;

/// Outbound handle for one connection's writer task
pub type DeliverySender = mpsc::Sender<Delivery>;

/// One subscription as seen from a destination's subscriber set
#[derive(Debug, Clone)]
pub struct SubscriberEntry {
    pub connection_id: ConnectionId,
    pub subscription_id: String,
    pub sender: DeliverySender,
}

/// Registry of destination -> subscribers
#[derive(Default)]
pub struct DestinationRegistry {
    destinations: DashMap<String, Vec<SubscriberEntry>>,

    /// connection -> (subscription id -> destination), for cleanup
    connections: DashMap<ConnectionId, HashMap<String, String>>,
}

impl DestinationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Idempotent per (connection, subscription
    /// id); re-using an id on a different destination rebinds it.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &str,
        destination: &str,
        sender: DeliverySender,
    ) {
        {
            let mut subscriptions = self.connections.entry(connection_id.clone()).or_default();

            if let Some(existing) = subscriptions.get(subscription_id) {
                if existing == destination {
                    debug!(
                        connection_id = %connection_id,
                        subscription_id,
                        destination,
                        "Duplicate subscribe ignored"
                    );
                    return;
                }
                let old_destination = existing.clone();
                drop_binding(&self.destinations, &old_destination, connection_id, subscription_id);
            }

            subscriptions.insert(subscription_id.to_string(), destination.to_string());
        }

        self.destinations
            .entry(destination.to_string())
            .or_default()
            .push(SubscriberEntry {
                connection_id: connection_id.clone(),
                subscription_id: subscription_id.to_string(),
                sender,
            });

        debug!(
            connection_id = %connection_id,
            subscription_id,
            destination,
            "Subscription registered"
        );
    }

    /// Remove a single binding; no error if absent
    pub fn unsubscribe(&self, connection_id: &ConnectionId, subscription_id: &str) {
        let destination = {
            let Some(mut subscriptions) = self.connections.get_mut(connection_id) else {
                return;
            };
            let removed = subscriptions.remove(subscription_id);
            if subscriptions.is_empty() {
                drop(subscriptions);
                self.connections.remove(connection_id);
            }
            match removed {
                Some(destination) => destination,
                None => return,
            }
        };

        drop_binding(&self.destinations, &destination, connection_id, subscription_id);

        debug!(
            connection_id = %connection_id,
            subscription_id,
            destination,
            "Subscription removed"
        );
    }

    /// Remove every binding owned by a connection. Called on every
    /// disconnect path; calling it again for a gone connection is a no-op.
    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        let Some((_, subscriptions)) = self.connections.remove(connection_id) else {
            return;
        };

        for (subscription_id, destination) in &subscriptions {
            drop_binding(&self.destinations, destination, connection_id, subscription_id);
        }

        debug!(
            connection_id = %connection_id,
            removed = subscriptions.len(),
            "Connection deregistered from all destinations"
        );
    }

    /// Snapshot of the current subscribers of a destination. Entries
    /// whose outbound channel is already gone are excluded; the next
    /// dispatch prunes them for real.
    #[must_use]
    pub fn subscribers_of(&self, destination: &str) -> Vec<SubscriberEntry> {
        self.destinations
            .get(destination)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|entry| !entry.sender.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Destination the given subscription id is bound to, if any
    #[must_use]
    pub fn destination_of(&self, connection_id: &ConnectionId, subscription_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|subscriptions| subscriptions.get(subscription_id).cloned())
    }

    /// Whether the connection holds any subscription to the destination
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId, destination: &str) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|subscriptions| {
                subscriptions.values().any(|d| d == destination)
            })
    }

    /// Number of live destination keys
    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Number of subscribers currently registered for a destination
    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.destinations
            .get(destination)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Number of connections holding at least one subscription
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Remove one (connection, subscription) pair from a destination's set,
/// garbage-collecting the key when the set empties
fn drop_binding(
    destinations: &DashMap<String, Vec<SubscriberEntry>>,
    destination: &str,
    connection_id: &ConnectionId,
    subscription_id: &str,
) {
    let Some(mut subscribers) = destinations.get_mut(destination) else {
        warn!(destination, "Binding referenced a destination that no longer exists");
        return;
    };

    subscribers.retain(|entry| {
        entry.connection_id != *connection_id || entry.subscription_id != subscription_id
    });

    if subscribers.is_empty() {
        drop(subscribers);
        destinations.remove(destination);
        debug!(destination, "Destination has no more subscribers, removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (DeliverySender, mpsc::Receiver<Delivery>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn test_subscribe_and_snapshot() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = sender();

        registry.subscribe(&conn, "sub-0", "/topic/42", tx);

        let subscribers = registry.subscribers_of("/topic/42");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].subscription_id, "sub-0");
        assert!(registry.is_subscribed(&conn, "/topic/42"));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = sender();

        registry.subscribe(&conn, "sub-0", "/topic/42", tx.clone());
        registry.subscribe(&conn, "sub-0", "/topic/42", tx);

        assert_eq!(registry.subscriber_count("/topic/42"), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_same_id_rebinds() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = sender();

        registry.subscribe(&conn, "sub-0", "/topic/42", tx.clone());
        registry.subscribe(&conn, "sub-0", "/topic/43", tx);

        assert_eq!(registry.subscriber_count("/topic/42"), 0);
        assert_eq!(registry.subscriber_count("/topic/43"), 1);
        assert_eq!(
            registry.destination_of(&conn, "sub-0").as_deref(),
            Some("/topic/43")
        );
        // The emptied key is garbage-collected
        assert_eq!(registry.destination_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_absent_is_noop() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();

        registry.unsubscribe(&conn, "sub-0");
        assert_eq!(registry.destination_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_connection_clears_every_binding() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();
        let (tx, _rx) = sender();
        let (other_tx, _other_rx) = sender();

        registry.subscribe(&conn, "sub-0", "/topic/42", tx.clone());
        registry.subscribe(&conn, "sub-1", "/topic/43", tx);
        registry.subscribe(&other, "sub-0", "/topic/42", other_tx);

        registry.remove_connection(&conn);

        assert!(registry
            .subscribers_of("/topic/42")
            .iter()
            .all(|entry| entry.connection_id == other));
        assert_eq!(registry.subscriber_count("/topic/43"), 0);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_excludes_closed_connections() {
        let registry = DestinationRegistry::new();
        let conn = ConnectionId::new();
        let gone = ConnectionId::new();
        let (tx, _rx) = sender();
        let (gone_tx, gone_rx) = sender();

        registry.subscribe(&conn, "sub-0", "/topic/42", tx);
        registry.subscribe(&gone, "sub-0", "/topic/42", gone_tx);
        drop(gone_rx);

        let subscribers = registry.subscribers_of("/topic/42");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].connection_id, conn);
    }
}
