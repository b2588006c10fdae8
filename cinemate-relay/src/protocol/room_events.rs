//! Verb-style events for the room presence channel
//!
//! The room transport speaks JSON objects of the form
//! `{"event": "joinRoom", "data": {...}}`. Inbound verbs map onto the
//! room channel operations; outbound events are always `message`,
//! `videoControl` or `videoUpdate` scoped to the room the client joined.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events a client may emit on the room channel
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        username: String,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        /// Relayed verbatim; only persistence needs the typed shape
        message: Value,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    VideoControl {
        room_id: String,
        action: String,
        #[serde(default)]
        time: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    VideoUpdate {
        room_id: String,
        video_url: Option<String>,
        current_time: Option<f64>,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
    Disconnect,
}

/// Events the relay emits on the room channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Message(Value),
    VideoControl(Value),
    VideoUpdate(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"joinRoom","data":{"roomId":"r1","username":"alice","avatarUrl":"https://cdn.example/a.png"}}"#,
        )
        .unwrap();

        match event {
            ClientEvent::JoinRoom {
                room_id,
                username,
                avatar_url,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(username, "alice");
                assert_eq!(avatar_url.as_deref(), Some("https://cdn.example/a.png"));
            }
            other => panic!("expected joinRoom, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_video_update_with_type_field() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"videoUpdate","data":{"roomId":"r1","videoUrl":"https://v.example/1.mp4","currentTime":3.5,"type":"CHANGE"}}"#,
        )
        .unwrap();

        match event {
            ClientEvent::VideoUpdate { kind, current_time, .. } => {
                assert_eq!(kind.as_deref(), Some("CHANGE"));
                assert_eq!(current_time, Some(3.5));
            }
            other => panic!("expected videoUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_disconnect_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"disconnect"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Disconnect));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_str(r#"{"event":"upload","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_message_event() {
        let event = ServerEvent::Message(json!({"type": "JOIN", "sender": "alice"}));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "message");
        assert_eq!(json["data"]["sender"], "alice");
    }

    #[test]
    fn test_serialize_video_control_event() {
        let event = ServerEvent::VideoControl(json!({"action": "pause", "time": 61.0}));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "videoControl");
        assert_eq!(json["data"]["action"], "pause");
    }
}
