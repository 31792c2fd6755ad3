//! # SeqRelay
//!
//! `seqrelay` is a realtime message relay built with Rust. Clients publish
//! over WebSockets with a dedup token, every accepted message gets a strictly
//! increasing sequence id in a durable log, and committed messages are fanned
//! out to every connected client across all relay processes. A client that
//! reconnects with its last seen sequence id is replayed exactly the messages
//! it missed.
//!
//! ## Core Modules
//!
//! - `broker`: The ingestion path (dedup, append, broadcast) and recovery replay.
//! - `bus`: The fan-out bus that carries committed messages to every gateway.
//! - `client`: Represents a connected WebSocket client and its handshake metadata.
//! - `cluster`: Coordinator and worker link for multi-process deployments.
//! - `config`: Handles loading and managing relay configuration.
//! - `persistence`: The sequence-ordered, dedup-indexed message log (sled).
//! - `transport`: The client protocol, connection gateway and WebSocket server.
//! - `utils`: Shared error types and logging setup.

pub mod broker;
pub mod bus;
pub mod client;
pub mod cluster;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
