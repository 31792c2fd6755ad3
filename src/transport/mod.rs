//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the JSON protocol used between clients and the server, the
//! handshake metadata, the connection gateway and the WebSocket server that
//! drives it.

pub mod gateway;
pub mod handshake;
pub mod message;
pub mod websocket;

pub use gateway::Gateway;
pub use handshake::ConnectParams;
pub use message::{ClientMessage, ServerMessage};
pub use websocket::{serve, start_websocket_server};
