//! Handshake authentication collaborator
//!
//! Authentication happens before a connection is admitted; the relay only
//! consumes the resulting identity. The session layer upstream owns
//! credentials, so the default implementation admits any handshake that
//! names a user.

use async_trait::async_trait;

use crate::models::Identity;
use crate::{Error, Result};

/// What a transport knows about a client before it is admitted
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Bearer token or passcode, transport-dependent
    pub token: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a handshake to an identity, or reject the connection
    async fn authenticate(&self, handshake: &Handshake) -> Result<Identity>;
}

/// Admits handshakes that carry a username, trusting the upstream session
/// layer that already authenticated the HTTP session
#[derive(Debug, Default, Clone, Copy)]
pub struct UpstreamSessionAuth;

#[async_trait]
impl Authenticator for UpstreamSessionAuth {
    async fn authenticate(&self, handshake: &Handshake) -> Result<Identity> {
        let username = handshake
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Authentication("handshake carries no username".to_string()))?;

        Ok(Identity::new(username, handshake.avatar_url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_named_user() {
        let auth = UpstreamSessionAuth;
        let handshake = Handshake {
            username: Some("alice".to_string()),
            avatar_url: Some("https://cdn.example/a.png".to_string()),
            ..Handshake::default()
        };

        let identity = auth.authenticate(&handshake).await.unwrap();
        assert_eq!(identity.username, "alice");
        assert!(identity.avatar_url.is_some());
    }

    #[tokio::test]
    async fn test_rejects_anonymous() {
        let auth = UpstreamSessionAuth;
        assert!(auth.authenticate(&Handshake::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_empty_username() {
        let auth = UpstreamSessionAuth;
        let handshake = Handshake {
            username: Some(String::new()),
            ..Handshake::default()
        };
        assert!(auth.authenticate(&handshake).await.is_err());
    }
}
