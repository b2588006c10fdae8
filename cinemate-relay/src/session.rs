//! Per-connection session state
//!
//! Tracks everything the relay knows about one connection besides its
//! subscriptions (those live in the registry): transport kind,
//! authenticated identity, joined room, and activity timestamps for the
//! idle sweeper. Each session carries a cancellation token; cancelling it
//! asks the connection's tasks to shut down through the normal
//! disconnect path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cinemate_core::models::{ConnectionId, Identity, RoomId};

/// Which wire protocol a connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw frame protocol (CONNECT/SUBSCRIBE/SEND/...)
    Frame,
    /// Verb-style room presence channel
    Room,
}

impl TransportKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Frame => "frame",
            Self::Room => "room",
        }
    }
}

/// Session state for one connection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub transport: TransportKind,
    pub identity: Option<Identity>,
    pub joined_room: Option<RoomId>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    pub cancel: CancellationToken,
}

impl SessionInfo {
    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Manager for all active connection sessions
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<DashMap<ConnectionId, SessionInfo>>,
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Returns the token its tasks should watch
    /// for forced shutdown.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        transport: TransportKind,
    ) -> CancellationToken {
        let now = Instant::now();
        let cancel = CancellationToken::new();

        self.sessions.insert(
            connection_id.clone(),
            SessionInfo {
                connection_id: connection_id.clone(),
                transport,
                identity: None,
                joined_room: None,
                connected_at: now,
                last_activity: now,
                message_count: 0,
                cancel: cancel.clone(),
            },
        );
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection_id,
            transport = transport.as_str(),
            active = self.sessions.len(),
            "Connection registered"
        );

        cancel
    }

    /// Attach an authenticated identity to a session
    pub fn set_identity(&self, connection_id: &ConnectionId, identity: Identity) {
        if let Some(mut session) = self.sessions.get_mut(connection_id) {
            session.identity = Some(identity);
            session.last_activity = Instant::now();
        }
    }

    /// Record the room a session is joined to (or `None` on leave)
    pub fn set_joined_room(&self, connection_id: &ConnectionId, room_id: Option<RoomId>) {
        if let Some(mut session) = self.sessions.get_mut(connection_id) {
            session.joined_room = room_id;
            session.last_activity = Instant::now();
        }
    }

    /// Record message activity for a connection
    pub fn record_message(&self, connection_id: &ConnectionId) {
        if let Some(mut session) = self.sessions.get_mut(connection_id) {
            session.last_activity = Instant::now();
            session.message_count += 1;
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh activity without counting a message (pings, pongs)
    pub fn touch(&self, connection_id: &ConnectionId) {
        if let Some(mut session) = self.sessions.get_mut(connection_id) {
            session.last_activity = Instant::now();
        }
    }

    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    /// Remove a session, returning its final state. Idempotent.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        let (_, session) = self.sessions.remove(connection_id)?;

        info!(
            connection_id = %connection_id,
            duration = ?session.duration(),
            message_count = session.message_count,
            "Connection unregistered"
        );

        Some(session)
    }

    /// Ask a connection's tasks to shut down
    pub fn cancel(&self, connection_id: &ConnectionId) {
        if let Some(session) = self.sessions.get(connection_id) {
            session.cancel.cancel();
        }
    }

    /// Connections silent beyond the idle timeout, for the sweeper
    #[must_use]
    pub fn idle_connections(&self, idle_timeout: Duration) -> Vec<ConnectionId> {
        let mut idle = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.idle_duration() > idle_timeout {
                warn!(
                    connection_id = %session.connection_id,
                    idle = ?session.idle_duration(),
                    "Connection missed heartbeats, marking for close"
                );
                idle.push(session.connection_id.clone());
            }
        }

        idle
    }

    /// Identities currently present in a room, reconstructed from
    /// connection metadata. The room has no stored aggregate of its own.
    #[must_use]
    pub fn members_of(&self, room_id: &RoomId) -> Vec<Identity> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().joined_room.as_ref() == Some(room_id))
            .filter_map(|entry| entry.value().identity.clone())
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let sessions = SessionManager::new();
        let conn = ConnectionId::new();

        sessions.register(conn.clone(), TransportKind::Frame);
        assert_eq!(sessions.connection_count(), 1);

        let removed = sessions.remove(&conn).expect("session existed");
        assert_eq!(removed.transport, TransportKind::Frame);
        assert_eq!(sessions.connection_count(), 0);
        assert!(sessions.remove(&conn).is_none());
    }

    #[test]
    fn test_identity_and_room_updates() {
        let sessions = SessionManager::new();
        let conn = ConnectionId::new();
        sessions.register(conn.clone(), TransportKind::Room);

        sessions.set_identity(&conn, Identity::new("alice", None));
        sessions.set_joined_room(&conn, Some(RoomId::from("r1")));

        let session = sessions.get(&conn).expect("session");
        assert_eq!(session.identity.as_ref().map(|i| i.username.as_str()), Some("alice"));
        assert_eq!(session.joined_room.as_ref().map(RoomId::as_str), Some("r1"));

        sessions.set_joined_room(&conn, None);
        assert!(sessions.get(&conn).expect("session").joined_room.is_none());
    }

    #[test]
    fn test_record_message() {
        let sessions = SessionManager::new();
        let conn = ConnectionId::new();
        sessions.register(conn.clone(), TransportKind::Frame);

        sessions.record_message(&conn);
        sessions.record_message(&conn);

        assert_eq!(sessions.get(&conn).expect("session").message_count, 2);
        assert_eq!(sessions.total_messages(), 2);
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let sessions = SessionManager::new();
        let idle_conn = ConnectionId::new();
        let live_conn = ConnectionId::new();
        sessions.register(idle_conn.clone(), TransportKind::Frame);
        sessions.register(live_conn.clone(), TransportKind::Room);

        tokio::time::sleep(Duration::from_millis(50)).await;
        sessions.touch(&live_conn);

        let idle = sessions.idle_connections(Duration::from_millis(25));
        assert_eq!(idle, vec![idle_conn]);
    }

    #[test]
    fn test_cancel_trips_token() {
        let sessions = SessionManager::new();
        let conn = ConnectionId::new();
        let token = sessions.register(conn.clone(), TransportKind::Frame);

        assert!(!token.is_cancelled());
        sessions.cancel(&conn);
        assert!(token.is_cancelled());
    }
}
