pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;

pub use bridge::{BridgeHandle, BrokerBridge, LinkState};
pub use dispatcher::{Delivery, DeliveryKind, Dispatcher};
pub use error::{Error, Result};
pub use registry::{DestinationRegistry, SubscriberEntry};
pub use room::RoomChannel;
pub use session::{SessionManager, TransportKind};
