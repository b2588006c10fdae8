use serde::{Deserialize, Serialize};

/// Chat message kind as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Chat,
    Join,
    Leave,
    Image,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Chat
    }
}

/// Reference to a message being replied to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A chat message as exchanged with clients and handed to the
/// persistence collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub content: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: sender.into(),
            avatar_url: None,
            kind: MessageKind::Chat,
            image: None,
            reply_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let mut message = ChatMessage::new("alice", "hello");
        message.avatar_url = Some("https://cdn.example/a.png".to_string());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["avatarUrl"], "https://cdn.example/a.png");
        assert_eq!(json["type"], "CHAT");
        assert!(json.get("image").is_none());
    }

    #[test]
    fn test_deserialize_defaults_kind() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"content":"hi","sender":"bob"}"#).unwrap();
        assert_eq!(message.kind, MessageKind::Chat);
        assert!(message.reply_to.is_none());
    }

    #[test]
    fn test_reply_round_trip() {
        let json = r#"{"content":"yes","sender":"bob","replyTo":{"id":7,"sender":"alice"}}"#;
        let message: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.reply_to.as_ref().map(|r| r.id), Some(7));
    }
}
