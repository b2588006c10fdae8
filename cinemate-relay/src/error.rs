//! Error types for the relay
//!
//! The taxonomy mirrors how each failure is handled: protocol errors get
//! an ERROR reply and the connection stays open, decode errors drop the
//! message, transport errors isolate one connection, broker errors
//! degrade to local-only broadcast. None of them terminate the process.

use thiserror::Error;

/// Relay error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or missing required header; recoverable, the
    /// connection stays open after an ERROR reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame carried a command the relay does not understand
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Bad JSON body; the message is dropped without a reply
    #[error("Decode error: {0}")]
    Decode(String),

    /// Write to a dead connection; only that connection is deregistered
    #[error("Transport error: {0}")]
    Transport(String),

    /// A connection acted on a room it never joined
    #[error("Connection {connection_id} is not joined to room {room_id}")]
    NotJoined {
        connection_id: String,
        room_id: String,
    },

    /// External broker unreachable; cross-process fan-out degrades,
    /// local delivery continues
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the sending connection should stay open after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Io(_))
    }
}
