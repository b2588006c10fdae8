pub mod chat;
pub mod envelope;
pub mod id;
pub mod presence;

pub use chat::{ChatMessage, MessageKind, ReplyTo};
pub use envelope::MessageEnvelope;
pub use id::{ConnectionId, RoomId};
pub use presence::Identity;
