use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON content type carried on every relayed message
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// One message addressed to a destination. Immutable once constructed;
/// the relay never persists envelopes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    destination: String,
    body: Value,
    content_type: String,
}

impl MessageEnvelope {
    /// Construct a JSON envelope for a destination
    #[must_use]
    pub fn json(destination: impl Into<String>, body: Value) -> Self {
        Self {
            destination: destination.into(),
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_envelope() {
        let envelope = MessageEnvelope::json("/topic/42", json!({"content": "hi"}));

        assert_eq!(envelope.destination(), "/topic/42");
        assert_eq!(envelope.content_type(), CONTENT_TYPE_JSON);
        assert_eq!(envelope.body()["content"], "hi");
    }
}
