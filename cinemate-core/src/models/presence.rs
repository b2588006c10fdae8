use serde::{Deserialize, Serialize};

/// Authenticated identity attached to a connection after handshake.
/// The avatar travels with presence notifications so clients can render
/// join/leave entries without a user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(username: impl Into<String>, avatar_url: Option<String>) -> Self {
        Self {
            username: username.into(),
            avatar_url,
        }
    }
}
