//! 实时网关: 把事件总线映射到 WebSocket 频道

pub mod channels;
pub mod hub;
pub mod messages;
pub mod socket;

pub use channels::Channel;
pub use hub::RealtimeHub;
pub use messages::{ClientMessage, GatewayError, ServerMessage};
pub use socket::serve_socket;
