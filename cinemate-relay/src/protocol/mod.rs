pub mod frame;
pub mod room_events;

pub use frame::{Frame, FrameCodec, FrameCommand};
pub use room_events::{ClientEvent, ServerEvent};
