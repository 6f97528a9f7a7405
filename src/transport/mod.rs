//! Transport layer
//!
//! WebSocket signaling: the coordinator endpoint and the participant client.

pub mod signaling_server;
pub mod signaling_client;

pub use signaling_server::handle_signaling_connection;
pub use signaling_client::{ReconnectPolicy, SignalingClient, SignalingClientError};
