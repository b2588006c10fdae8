//! Persistence collaborator for chat messages
//!
//! The relay never owns message storage. Messages are handed to an
//! external store asynchronously; a slow or failing store must not add
//! latency or failure coupling to the real-time path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::models::{ChatMessage, RoomId};
use crate::{Error, Result};

/// External chat-message store. Implementations are best-effort: callers
/// go through [`persist_best_effort`] and never await the outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage, room_id: &RoomId) -> Result<()>;
}

/// HTTP client for the persistence service
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessageStore {
    pub fn new(config: &PersistenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn save_message(&self, message: &ChatMessage, room_id: &RoomId) -> Result<()> {
        let url = format!("{}/rooms/{}/messages", self.base_url, room_id.as_str());

        let response = self.client.post(&url).json(message).send().await?;
        if !response.status().is_success() {
            return Err(Error::Persistence(format!(
                "persistence service replied {} for room {}",
                response.status(),
                room_id.as_str()
            )));
        }

        Ok(())
    }
}

/// Store that discards everything, for deployments without a persistence
/// service and for tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessageStore;

#[async_trait]
impl MessageStore for NoopMessageStore {
    async fn save_message(&self, _message: &ChatMessage, room_id: &RoomId) -> Result<()> {
        debug!(room_id = room_id.as_str(), "Message store disabled, dropping");
        Ok(())
    }
}

/// Hand a message to the store without coupling the caller to its fate.
/// Failures are logged and swallowed.
pub fn persist_best_effort(store: Arc<dyn MessageStore>, message: ChatMessage, room_id: RoomId) {
    tokio::spawn(async move {
        if let Err(e) = store.save_message(&message, &room_id).await {
            warn!(
                room_id = room_id.as_str(),
                error = %e,
                "Failed to persist chat message"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_store_accepts_everything() {
        let store = NoopMessageStore;
        let message = ChatMessage::new("alice", "hello");

        assert!(store
            .save_message(&message, &RoomId::from("r1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_store_failure() {
        let mut mock = MockMessageStore::new();
        mock.expect_save_message()
            .returning(|_, _| Err(Error::Persistence("store down".to_string())));

        // Must not panic or propagate; the spawned task logs and exits.
        persist_best_effort(
            Arc::new(mock),
            ChatMessage::new("alice", "hello"),
            RoomId::from("r1"),
        );
        tokio::task::yield_now().await;
    }
}
