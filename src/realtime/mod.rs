//! In-memory delivery side of chat: who is connected, what they listen to, and
//! how events reach them. Nothing here touches the database.

pub mod broadcast;
pub mod frames;
pub mod registry;

pub use broadcast::Broadcaster;
pub use frames::{ClientFrame, ServerFrame, TypingPayload};
pub use registry::{ConnectionId, Registry};
