//! External broker bridge for cross-process fan-out
//!
//! A process-wide Redis pub/sub link. Local room traffic selected for
//! cross-process delivery is published under a channel derived from the
//! canonical destination string; publications received from other nodes
//! are fed through the same local dispatch path as locally-originated
//! sends. Envelopes carry the publishing node's id and each node ignores
//! its own, so nothing loops back out: bridge-originated dispatches are
//! local-only by construction.
//!
//! On any connection error the link degrades and reconnects after a
//! fixed delay; local broadcast is never affected. The publisher task
//! keeps the link honest with periodic PINGs and treats a missed pong as
//! a dead connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cinemate_core::config::BrokerConfig;
use cinemate_core::models::MessageEnvelope;

use crate::dispatcher::{DeliveryKind, Dispatcher};
use crate::error::{Error, Result};

/// Timeout for individual Redis operations
const REDIS_TIMEOUT_SECS: u64 = 5;

/// State of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// A previously healthy link failed; reconnect pending while local
    /// broadcast continues
    Degraded,
}

impl LinkState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Degraded => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }
}

/// Translate a domain exchange/routing-key pair to the canonical
/// destination string. Chat and video traffic share the room topic, so a
/// message published externally and one dispatched locally reach
/// subscribers through identical code paths.
#[must_use]
pub fn destination_for(exchange: &str, routing_key: &str) -> String {
    if exchange == crate::room::CHAT_EXCHANGE || exchange == crate::room::VIDEO_EXCHANGE {
        if let Some(room_id) = routing_key.split('.').nth(1) {
            return format!("/topic/{room_id}");
        }
    }
    format!("/{exchange}/{routing_key}")
}

/// Redis channel carrying publications for one destination
fn channel_for(key_prefix: &str, destination: &str) -> String {
    format!("{key_prefix}dest:{destination}")
}

/// Pattern matching every relay channel under this prefix
fn channel_pattern(key_prefix: &str) -> String {
    format!("{key_prefix}dest:*")
}

/// Envelope for publications on the broker. `node_id` prevents echo:
/// each node ignores its own publications.
#[derive(Debug, Serialize, Deserialize)]
struct BridgeEnvelope {
    node_id: String,
    destination: String,
    kind: String,
    body: Value,
    timestamp: DateTime<Utc>,
}

/// One publication queued for the broker
#[derive(Debug)]
struct OutboundPublication {
    destination: String,
    kind: DeliveryKind,
    body: Value,
}

/// Cheap clonable handle for publishing through the bridge
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<OutboundPublication>,
    state: Arc<AtomicU8>,
}

impl BridgeHandle {
    /// Queue a publication for cross-process delivery. Never blocks; if
    /// the queue is saturated (prolonged broker outage) the publication
    /// is dropped with a warning and local delivery is unaffected.
    pub fn publish(&self, exchange: &str, routing_key: &str, kind: DeliveryKind, body: Value) {
        let destination = destination_for(exchange, routing_key);

        match self.tx.try_send(OutboundPublication {
            destination: destination.clone(),
            kind,
            body,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    destination = %destination,
                    "Bridge publish queue full, dropping cross-process publication"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(destination = %destination, "Bridge is shut down, dropping publication");
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

/// Process-wide link to the external broker. Constructed once at
/// startup, never per-connection.
pub struct BrokerBridge {
    client: redis::Client,
    dispatcher: Dispatcher,
    node_id: String,
    config: BrokerConfig,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl BrokerBridge {
    /// Capacity of the publish queue. Publications are dropped with a
    /// warning when full.
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    pub fn new(config: BrokerConfig, dispatcher: Dispatcher, node_id: String) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::Broker(format!("invalid broker url: {e}")))?;

        Ok(Self {
            client,
            dispatcher,
            node_id,
            config,
            state: Arc::new(AtomicU8::new(LinkState::Disconnected.to_u8())),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Stop both bridge tasks
    pub fn shutdown(&self) {
        info!("Shutting down broker bridge");
        self.cancel.cancel();
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.config.reconnect_delay_seconds)
    }

    /// Start the publisher and subscriber tasks and return the publish
    /// handle
    pub fn start(self: &Arc<Self>) -> BridgeHandle {
        let (publish_tx, publish_rx) =
            mpsc::channel::<OutboundPublication>(Self::PUBLISH_CHANNEL_CAPACITY);

        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.run_publisher(publish_rx).await;
        });

        let subscriber = self.clone();
        tokio::spawn(async move {
            subscriber.run_subscriber_loop().await;
        });

        BridgeHandle {
            tx: publish_tx,
            state: self.state.clone(),
        }
    }

    /// Publisher: drain the publish queue onto the broker, heartbeating
    /// the connection and reconnecting after the fixed delay on failure
    async fn run_publisher(self: Arc<Self>, mut publish_rx: mpsc::Receiver<OutboundPublication>) {
        // A publication that failed mid-send is retried after reconnect
        let mut retry: Option<OutboundPublication> = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("Bridge publisher cancelled");
                return;
            }

            self.set_state(LinkState::Connecting);
            let mut conn = match timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                self.client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    error!(error = %e, "Bridge publisher failed to connect, retrying after fixed delay");
                    self.set_state(LinkState::Disconnected);
                    if self.sleep_before_reconnect().await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    error!("Bridge publisher timed out connecting, retrying after fixed delay");
                    self.set_state(LinkState::Disconnected);
                    if self.sleep_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            };

            info!("Bridge publisher (re)connected");
            self.set_state(LinkState::Connected);

            if let Some(publication) = retry.take() {
                if let Err(e) = self.publish_one(&mut conn, &publication).await {
                    warn!(error = %e, "Retried publication failed again, keeping for next reconnect");
                    retry = Some(publication);
                    self.set_state(LinkState::Degraded);
                    if self.sleep_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            }

            let mut heartbeat =
                tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; that doubles as a
            // connection sanity check
            let disconnected = loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        info!("Bridge publisher cancelled");
                        return;
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.ping(&mut conn).await {
                            warn!(error = %e, "Broker heartbeat failed, reconnecting");
                            break true;
                        }
                    }
                    request = publish_rx.recv() => match request {
                        Some(publication) => {
                            if let Err(e) = self.publish_one(&mut conn, &publication).await {
                                error!(error = %e, "Publish failed, saving for retry after reconnect");
                                retry = Some(publication);
                                break true;
                            }
                        }
                        None => {
                            info!("Bridge publish queue closed, publisher exiting");
                            break false;
                        }
                    }
                }
            };

            if !disconnected {
                return;
            }

            self.set_state(LinkState::Degraded);
            if self.sleep_before_reconnect().await {
                return;
            }
        }
    }

    /// Sleep the fixed reconnect delay. Returns true when cancelled.
    async fn sleep_before_reconnect(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(self.reconnect_delay()) => false,
        }
    }

    async fn ping(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<()> {
        let pong: String = timeout(
            Duration::from_secs(self.config.heartbeat_timeout_seconds),
            redis::cmd("PING").query_async(conn),
        )
        .await
        .map_err(|_| Error::Broker("heartbeat timed out".to_string()))??;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::Broker(format!("unexpected heartbeat reply: {pong}")))
        }
    }

    async fn publish_one(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        publication: &OutboundPublication,
    ) -> Result<()> {
        let channel = channel_for(&self.config.key_prefix, &publication.destination);
        let envelope = BridgeEnvelope {
            node_id: self.node_id.clone(),
            destination: publication.destination.clone(),
            kind: publication.kind.as_str().to_string(),
            body: publication.body.clone(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope)?;

        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::AsyncCommands::publish(conn, &channel, &payload),
        )
        .await
        .map_err(|_| Error::Broker("publish timed out".to_string()))??;

        debug!(channel = %channel, receivers, "Publication relayed to broker");
        Ok(())
    }

    /// Subscriber: receive publications from other nodes and feed them
    /// through local dispatch, reconnecting after the fixed delay when
    /// the connection drops
    async fn run_subscriber_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                info!("Bridge subscriber cancelled");
                return;
            }

            match self.run_subscriber().await {
                SubscriberExit::Disconnected => {
                    error!(
                        "Bridge subscriber stream ended, reconnecting after {}s",
                        self.config.reconnect_delay_seconds
                    );
                    self.set_state(LinkState::Degraded);
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(error = %e, "Bridge subscriber failed to connect, retrying after fixed delay");
                    self.set_state(LinkState::Disconnected);
                }
            }

            if self.sleep_before_reconnect().await {
                return;
            }
        }
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::Broker(format!(
                    "failed to open pub/sub connection: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Broker(
                    "timed out opening pub/sub connection".to_string(),
                ));
            }
        };

        let pattern = channel_pattern(&self.config.key_prefix);
        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.psubscribe(&pattern),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::Broker(format!(
                    "failed to subscribe to {pattern}: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Broker(format!(
                    "timed out subscribing to {pattern}"
                )));
            }
        }

        info!(pattern = %pattern, "Bridge subscriber connected");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload from broker");
                    continue;
                }
            };

            match serde_json::from_str::<BridgeEnvelope>(&payload) {
                Ok(envelope) => {
                    if envelope.node_id == self.node_id {
                        debug!(channel = %channel, "Ignoring own publication");
                        continue;
                    }
                    self.dispatch_external(envelope);
                }
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Failed to parse broker envelope");
                }
            }
        }

        // Stream returned None: the broker connection was lost
        SubscriberExit::Disconnected
    }

    /// Deliver an externally received publication to local subscribers.
    /// Never republishes: local dispatch is the end of the line for
    /// bridge traffic.
    fn dispatch_external(&self, envelope: BridgeEnvelope) {
        let kind = DeliveryKind::parse(&envelope.kind).unwrap_or_else(|| {
            warn!(kind = %envelope.kind, "Unknown event kind from broker, delivering as message");
            DeliveryKind::Message
        });

        let delivered = self.dispatcher.dispatch(
            &MessageEnvelope::json(envelope.destination.clone(), envelope.body),
            kind,
        );

        debug!(
            destination = %envelope.destination,
            delivered, "Forwarded broker publication to local subscribers"
        );
    }
}

/// How the subscriber loop exited
enum SubscriberExit {
    /// Connection was healthy, then the stream ended
    Disconnected,
    /// Could not connect or subscribe
    ConnectFailed(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DestinationRegistry;
    use serde_json::json;

    #[test]
    fn test_chat_exchange_maps_to_room_topic() {
        assert_eq!(destination_for("chat.exchange", "room.42"), "/topic/42");
    }

    #[test]
    fn test_video_exchange_maps_to_room_topic() {
        assert_eq!(destination_for("video.exchange", "video.42"), "/topic/42");
    }

    #[test]
    fn test_other_exchange_maps_verbatim() {
        assert_eq!(
            destination_for("logs.exchange", "app.web"),
            "/logs.exchange/app.web"
        );
    }

    #[test]
    fn test_malformed_routing_key_falls_back() {
        assert_eq!(
            destination_for("chat.exchange", "lobby"),
            "/chat.exchange/lobby"
        );
    }

    #[test]
    fn test_channel_naming_round_trip() {
        let channel = channel_for("cinemate:", "/topic/42");
        assert_eq!(channel, "cinemate:dest:/topic/42");
        assert!(channel.starts_with(&channel_pattern("cinemate:").replace('*', "")));
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = BridgeEnvelope {
            node_id: "node1".to_string(),
            destination: "/topic/42".to_string(),
            kind: "message".to_string(),
            body: json!({"content": "hi"}),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: BridgeEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, "node1");
        assert_eq!(parsed.destination, "/topic/42");
        assert_eq!(parsed.body["content"], "hi");
    }

    #[test]
    fn test_link_state_round_trip() {
        for state in [
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Degraded,
        ] {
            assert_eq!(LinkState::from_u8(state.to_u8()), state);
        }
    }

    #[tokio::test]
    async fn test_handle_drops_when_queue_saturated() {
        // A handle with a full single-slot queue must not block or error
        let (tx, _rx) = mpsc::channel(1);
        let handle = BridgeHandle {
            tx,
            state: Arc::new(AtomicU8::new(LinkState::Degraded.to_u8())),
        };

        handle.publish("chat.exchange", "room.42", DeliveryKind::Message, json!({"n": 1}));
        handle.publish("chat.exchange", "room.42", DeliveryKind::Message, json!({"n": 2}));

        assert_eq!(handle.state(), LinkState::Degraded);
    }

    // Integration test requires a running Redis server
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_cross_node_relay() {
        use cinemate_core::models::ConnectionId;

        let config = BrokerConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            ..BrokerConfig::default()
        };

        let registry = Arc::new(DestinationRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());

        let node1 = Arc::new(
            BrokerBridge::new(config.clone(), dispatcher.clone(), "node1".to_string()).unwrap(),
        );
        let node2 = Arc::new(
            BrokerBridge::new(config, dispatcher.clone(), "node2".to_string()).unwrap(),
        );

        let handle1 = node1.start();
        let _handle2 = node2.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(&ConnectionId::new(), "sub-0", "/topic/42", tx);

        handle1.publish(
            "chat.exchange",
            "room.42",
            DeliveryKind::Message,
            json!({"content": "hello from node1"}),
        );

        // node2's subscriber receives the publication and dispatches it
        // locally; node1 ignores its own envelope
        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open");
        assert_eq!(delivery.body["content"], "hello from node1");
    }
}
