//! The `client` module defines the representation of a connection held by a
//! gateway.
//!
//! It provides the `Client` struct, which encapsulates one connected client,
//! including its identifiers and the channel for sending frames to it, and
//! `ConnectionMeta`, the metadata supplied when the connection is established.

pub mod connection;
pub use connection::{Client, ConnectionId, ConnectionMeta, SessionId, new_session_id};
