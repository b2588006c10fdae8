//! Broadcast dispatcher: fans one envelope out to every subscriber of a
//! destination
//!
//! Delivery is transport-neutral. Each subscriber receives a [`Delivery`]
//! carrying its own subscription id; the connection's writer task renders
//! it as a MESSAGE frame or a room-channel event depending on transport.
//!
//! Per-recipient failures are isolated: a closed or saturated consumer
//! never aborts delivery to the rest. Sends use `try_send` on the
//! connection's bounded channel, so a slow consumer loses messages
//! instead of stalling the dispatcher. Per-destination ordering from one
//! origin holds because dispatch runs synchronously on the origin's task
//! and each outbound channel is FIFO.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use cinemate_core::models::{ConnectionId, MessageEnvelope};

use crate::registry::DestinationRegistry;

/// How a delivery should be presented on the room channel. The raw-frame
/// transport renders every kind as a MESSAGE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Message,
    VideoControl,
    VideoUpdate,
}

impl DeliveryKind {
    /// Event name as emitted on the room channel and carried in broker
    /// envelopes
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::VideoControl => "videoControl",
            Self::VideoUpdate => "videoUpdate",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Self::Message),
            "videoControl" => Some(Self::VideoControl),
            "videoUpdate" => Some(Self::VideoUpdate),
            _ => None,
        }
    }
}

/// One message addressed to one subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: String,
    pub subscription_id: String,
    pub kind: DeliveryKind,
    pub body: Value,
    pub content_type: String,
}

/// Fan-out engine over the destination registry
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<DestinationRegistry>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(registry: Arc<DestinationRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DestinationRegistry> {
        &self.registry
    }

    /// Deliver an envelope to every current subscriber of its
    /// destination. Returns the number of deliveries handed to writer
    /// tasks. Zero subscribers is not an error.
    pub fn dispatch(&self, envelope: &MessageEnvelope, kind: DeliveryKind) -> usize {
        let subscribers = self.registry.subscribers_of(envelope.destination());
        if subscribers.is_empty() {
            debug!(
                destination = envelope.destination(),
                "Dispatch to empty destination"
            );
            return 0;
        }

        let mut sent = 0;
        let mut dead_connections: Vec<ConnectionId> = Vec::new();

        for subscriber in subscribers {
            let delivery = Delivery {
                destination: envelope.destination().to_string(),
                subscription_id: subscriber.subscription_id.clone(),
                kind,
                body: envelope.body().clone(),
                content_type: envelope.content_type().to_string(),
            };

            match subscriber.sender.try_send(delivery) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    // Saturated consumer: drop this message for it, keep
                    // its subscription
                    warn!(
                        connection_id = %subscriber.connection_id,
                        destination = envelope.destination(),
                        "Outbound buffer saturated, dropping message for slow consumer"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        connection_id = %subscriber.connection_id,
                        destination = envelope.destination(),
                        "Writer gone mid-dispatch, deregistering connection"
                    );
                    dead_connections.push(subscriber.connection_id.clone());
                }
            }
        }

        for connection_id in dead_connections {
            self.registry.remove_connection(&connection_id);
        }

        debug!(
            destination = envelope.destination(),
            sent, "Dispatch complete"
        );

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<DestinationRegistry>, Dispatcher) {
        let registry = Arc::new(DestinationRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn test_one_delivery_per_subscriber_with_own_id() {
        let (registry, dispatcher) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        registry.subscribe(&ConnectionId::new(), "sub-a", "/topic/42", tx_a);
        registry.subscribe(&ConnectionId::new(), "sub-b", "/topic/42", tx_b);

        let envelope = MessageEnvelope::json("/topic/42", json!({"content": "hi"}));
        let sent = dispatcher.dispatch(&envelope, DeliveryKind::Message);
        assert_eq!(sent, 2);

        let delivery_a = rx_a.recv().await.expect("delivery for a");
        let delivery_b = rx_b.recv().await.expect("delivery for b");
        assert_eq!(delivery_a.subscription_id, "sub-a");
        assert_eq!(delivery_b.subscription_id, "sub-b");
        assert_eq!(delivery_a.destination, "/topic/42");
        assert_eq!(delivery_a.content_type, "application/json");
        assert_eq!(delivery_a.body["content"], "hi");
    }

    #[tokio::test]
    async fn test_empty_destination_delivers_nothing() {
        let (_registry, dispatcher) = setup();

        let envelope = MessageEnvelope::json("/topic/42", json!({"content": "hi"}));
        assert_eq!(dispatcher.dispatch(&envelope, DeliveryKind::Message), 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_block_others() {
        let (registry, dispatcher) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        let gone = ConnectionId::new();

        registry.subscribe(&ConnectionId::new(), "sub-a", "/topic/42", tx_a);
        registry.subscribe(&gone, "sub-b", "/topic/42", tx_b);
        registry.subscribe(&ConnectionId::new(), "sub-c", "/topic/42", tx_c);
        drop(rx_b);

        let envelope = MessageEnvelope::json("/topic/42", json!({"content": "hi"}));
        let sent = dispatcher.dispatch(&envelope, DeliveryKind::Message);

        assert_eq!(sent, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
        // The dead connection is pruned from the registry
        assert!(!registry.is_subscribed(&gone, "/topic/42"));
    }

    #[tokio::test]
    async fn test_saturated_consumer_drops_without_losing_subscription() {
        let (registry, dispatcher) = setup();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(1);

        registry.subscribe(&conn, "sub-0", "/topic/42", tx);

        let first = MessageEnvelope::json("/topic/42", json!({"seq": 1}));
        let second = MessageEnvelope::json("/topic/42", json!({"seq": 2}));

        assert_eq!(dispatcher.dispatch(&first, DeliveryKind::Message), 1);
        // Buffer full: the second message is dropped for this consumer
        assert_eq!(dispatcher.dispatch(&second, DeliveryKind::Message), 0);
        assert!(registry.is_subscribed(&conn, "/topic/42"));

        assert_eq!(rx.recv().await.expect("first delivery").body["seq"], 1);
    }

    #[tokio::test]
    async fn test_same_origin_order_preserved() {
        let (registry, dispatcher) = setup();
        let (tx, mut rx) = mpsc::channel(8);

        registry.subscribe(&ConnectionId::new(), "sub-0", "/topic/42", tx);

        for seq in 0..5 {
            let envelope = MessageEnvelope::json("/topic/42", json!({"seq": seq}));
            dispatcher.dispatch(&envelope, DeliveryKind::Message);
        }

        for seq in 0..5 {
            assert_eq!(rx.recv().await.expect("delivery").body["seq"], seq);
        }
    }
}
