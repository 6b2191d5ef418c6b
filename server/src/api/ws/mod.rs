//! WebSocket surface: protocol, hub, and per-connection sessions

mod hub;
mod protocol;
mod session;

pub use hub::SocketHub;
pub use protocol::{ClientEvent, MessagePayload, ServerEvent};
pub use session::ws_handler;
