//! The `error` module defines the error types used within `seqrelay`.
//!
//! None of these are fatal to a connection. Store and bus errors are
//! classified as transient by the ingestion path and recovery replay, which
//! log them and degrade silently; `RelayError` only surfaces while
//! bootstrapping a process (configuration, binding sockets, dialing the
//! coordinator).

use thiserror::Error;

/// A storage-layer fault unrelated to the dedup uniqueness constraint.
///
/// Every variant means the operation had no durable effect.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Sled(#[from] sled::Error),

    #[error("stored record could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("blocking storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("coordinator link is closed")]
    LinkClosed,

    #[error("coordinator did not answer within {0} ms")]
    Timeout(u64),

    #[error("coordinator reported: {0}")]
    Remote(String),

    #[error("sequence space exhausted")]
    Exhausted,
}

/// Failure to hand a message to the fan-out bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("bus frame could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Top-level error for starting and running a relay process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to open message log: {0}")]
    Store(#[from] StoreError),

    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
