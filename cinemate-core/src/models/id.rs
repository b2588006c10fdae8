use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for entity IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Room ID type (opaque string key, assigned by the room service)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical broadcast destination for this room
    #[must_use]
    pub fn topic(&self) -> String {
        format!("/topic/{}", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection ID type (nanoid, assigned at transport handshake)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_length() {
        assert_eq!(generate_id().len(), 12);
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_room_topic() {
        let room = RoomId::from("42");
        assert_eq!(room.topic(), "/topic/42");
    }
}
