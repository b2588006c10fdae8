//! Room presence channel
//!
//! Higher-level room verbs (join, leave, send-message, video control)
//! layered on the destination registry and broadcast dispatcher. Both
//! transports reach rooms through this type, so the fan-out logic exists
//! exactly once. Membership is canonically the subscription to the
//! room's `/topic/{roomId}` destination; presence metadata (username,
//! avatar) lives on the connection session.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use cinemate_core::models::{ChatMessage, ConnectionId, Identity, MessageEnvelope, RoomId};
use cinemate_core::persist::{persist_best_effort, MessageStore};

use crate::bridge::BridgeHandle;
use crate::dispatcher::{DeliveryKind, Dispatcher};
use crate::error::{Error, Result};
use crate::registry::{DeliverySender, DestinationRegistry};
use crate::session::SessionManager;

/// Exchange for chat traffic republished to the broker
pub const CHAT_EXCHANGE: &str = "chat.exchange";
/// Exchange for video sync traffic republished to the broker
pub const VIDEO_EXCHANGE: &str = "video.exchange";

/// Why a member left, for the synthesized notification text
#[derive(Debug, Clone, Copy)]
enum LeaveReason {
    Left,
    Disconnected,
}

/// Room-oriented facade over the registry and dispatcher
#[derive(Clone)]
pub struct RoomChannel {
    registry: Arc<DestinationRegistry>,
    dispatcher: Dispatcher,
    sessions: SessionManager,
    store: Arc<dyn MessageStore>,
    bridge: Option<BridgeHandle>,
}

impl RoomChannel {
    #[must_use]
    pub fn new(
        registry: Arc<DestinationRegistry>,
        dispatcher: Dispatcher,
        sessions: SessionManager,
        store: Arc<dyn MessageStore>,
        bridge: Option<BridgeHandle>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            sessions,
            store,
            bridge,
        }
    }

    /// Subscription id used for a room membership subscription. Ids are
    /// connection-scoped, so every member uses the same one.
    fn room_subscription_id(room_id: &RoomId) -> String {
        format!("room:{room_id}")
    }

    /// Join a room: subscribe to its topic, record presence, and notify
    /// the room. Re-joining the same room is a no-op without a duplicate
    /// JOIN. Joining while joined elsewhere leaves the old room first.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        sender: DeliverySender,
        room_id: &RoomId,
        identity: Identity,
    ) -> usize {
        if let Some(session) = self.sessions.get(connection_id) {
            match session.joined_room {
                Some(ref joined) if joined == room_id => {
                    debug!(
                        connection_id = %connection_id,
                        room_id = %room_id,
                        "Already joined, ignoring duplicate join"
                    );
                    return 0;
                }
                Some(joined) => {
                    self.leave_room(connection_id, &joined, LeaveReason::Left);
                }
                None => {}
            }
        }

        self.sessions.set_identity(connection_id, identity.clone());
        self.registry.subscribe(
            connection_id,
            &Self::room_subscription_id(room_id),
            &room_id.topic(),
            sender,
        );
        self.sessions.set_joined_room(connection_id, Some(room_id.clone()));

        let notification = presence_notification(
            "JOIN",
            &identity,
            format!("{} đã tham gia phòng", identity.username),
        );
        self.dispatcher.dispatch(
            &MessageEnvelope::json(room_id.topic(), notification),
            DeliveryKind::Message,
        )
    }

    /// Leave a room and notify the remaining members. Idempotent when
    /// not currently joined.
    pub fn leave(&self, connection_id: &ConnectionId, room_id: &RoomId) -> usize {
        let joined = self
            .sessions
            .get(connection_id)
            .and_then(|session| session.joined_room);
        if joined.as_ref() != Some(room_id) {
            debug!(
                connection_id = %connection_id,
                room_id = %room_id,
                "Leave for a room the connection never joined, ignoring"
            );
            return 0;
        }

        self.leave_room(connection_id, room_id, LeaveReason::Left)
    }

    /// Broadcast a chat message to the room, persist it best-effort, and
    /// republish it for cross-process fan-out
    pub fn send_message(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        message: Value,
    ) -> Result<usize> {
        self.require_joined(connection_id, room_id)?;
        self.sessions.record_message(connection_id);

        let delivered = self.dispatcher.dispatch(
            &MessageEnvelope::json(room_id.topic(), message.clone()),
            DeliveryKind::Message,
        );

        // Best-effort persistence; failures never reach the sender
        match serde_json::from_value::<ChatMessage>(message.clone()) {
            Ok(chat) => persist_best_effort(self.store.clone(), chat, room_id.clone()),
            Err(e) => debug!(
                room_id = %room_id,
                error = %e,
                "Message shape not persistable, relaying only"
            ),
        }

        if let Some(bridge) = &self.bridge {
            bridge.publish(
                CHAT_EXCHANGE,
                &format!("room.{room_id}"),
                DeliveryKind::Message,
                message,
            );
        }

        Ok(delivered)
    }

    /// Broadcast a playback control action (play, pause, seek)
    pub fn video_control(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        action: &str,
        time: Option<f64>,
    ) -> Result<usize> {
        self.require_joined(connection_id, room_id)?;
        self.sessions.record_message(connection_id);

        let body = json!({ "action": action, "time": time });
        let delivered = self.dispatcher.dispatch(
            &MessageEnvelope::json(room_id.topic(), body.clone()),
            DeliveryKind::VideoControl,
        );

        if let Some(bridge) = &self.bridge {
            bridge.publish(
                VIDEO_EXCHANGE,
                &format!("video.{room_id}"),
                DeliveryKind::VideoControl,
                body,
            );
        }

        Ok(delivered)
    }

    /// Broadcast a video source/position update
    pub fn video_update(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        video_url: Option<String>,
        current_time: Option<f64>,
        kind: Option<String>,
    ) -> Result<usize> {
        self.require_joined(connection_id, room_id)?;
        self.sessions.record_message(connection_id);

        let body = json!({
            "videoUrl": video_url,
            "currentTime": current_time,
            "type": kind,
        });
        let delivered = self.dispatcher.dispatch(
            &MessageEnvelope::json(room_id.topic(), body.clone()),
            DeliveryKind::VideoUpdate,
        );

        if let Some(bridge) = &self.bridge {
            bridge.publish(
                VIDEO_EXCHANGE,
                &format!("video.{room_id}"),
                DeliveryKind::VideoUpdate,
                body,
            );
        }

        Ok(delivered)
    }

    /// Tear down a connection on any close path. If it was joined to a
    /// room, a LEAVE is synthesized from its last-known identity before
    /// its subscriptions go away.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some(session) = self.sessions.remove(connection_id) {
            if let (Some(room_id), Some(identity)) = (session.joined_room, session.identity) {
                let notification = presence_notification(
                    "LEAVE",
                    &identity,
                    format!("{} đã ngắt kết nối", identity.username),
                );
                self.dispatcher.dispatch(
                    &MessageEnvelope::json(room_id.topic(), notification),
                    DeliveryKind::Message,
                );
            }
        }

        self.registry.remove_connection(connection_id);
    }

    /// Identities currently present in a room
    #[must_use]
    pub fn members_of(&self, room_id: &RoomId) -> Vec<Identity> {
        self.sessions.members_of(room_id)
    }

    fn require_joined(&self, connection_id: &ConnectionId, room_id: &RoomId) -> Result<()> {
        if self.registry.is_subscribed(connection_id, &room_id.topic()) {
            Ok(())
        } else {
            Err(Error::NotJoined {
                connection_id: connection_id.to_string(),
                room_id: room_id.to_string(),
            })
        }
    }

    fn leave_room(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        reason: LeaveReason,
    ) -> usize {
        let identity = self
            .sessions
            .get(connection_id)
            .and_then(|session| session.identity);

        // Unsubscribe first so the leaver does not see its own LEAVE
        self.registry
            .unsubscribe(connection_id, &Self::room_subscription_id(room_id));
        self.sessions.set_joined_room(connection_id, None);

        let Some(identity) = identity else {
            warn!(
                connection_id = %connection_id,
                room_id = %room_id,
                "Leaving connection has no identity, skipping notification"
            );
            return 0;
        };

        let content = match reason {
            LeaveReason::Left => format!("{} đã rời phòng", identity.username),
            LeaveReason::Disconnected => format!("{} đã ngắt kết nối", identity.username),
        };
        let notification = presence_notification("LEAVE", &identity, content);

        self.dispatcher.dispatch(
            &MessageEnvelope::json(room_id.topic(), notification),
            DeliveryKind::Message,
        )
    }
}

/// JOIN/LEAVE notification body: `{type, sender, avatarUrl, content}`
fn presence_notification(kind: &str, identity: &Identity, content: String) -> Value {
    json!({
        "type": kind,
        "sender": identity.username,
        "avatarUrl": identity.avatar_url,
        "content": content,
    })
}
