//! The `persistence` module provides the durable, append-only message log.
//!
//! The log is the single serialization point of the relay: it enforces the
//! uniqueness of client dedup tokens and assigns every accepted message a
//! strictly increasing sequence id. Recovery replay reads back from it by
//! offset.
//!
//! `SledLog` is the embedded implementation. In a multi-process deployment
//! workers reach the coordinator's `SledLog` through
//! [`ClusterLink`](crate::cluster::ClusterLink), which implements the same
//! [`DurableLog`] contract remotely.

pub mod sled_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::StoreError;

pub use sled_store::SledLog;

/// Sequence identifier assigned by the log. The first message gets `1`.
pub type SequenceId = u64;

/// A message as persisted and as returned by [`DurableLog::read_from`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence_id: SequenceId,
    pub dedup_token: String,
    pub content: String,
    /// Milliseconds since UNIX epoch at commit.
    pub timestamp: i64,
}

/// Result of a single [`DurableLog::append`].
#[derive(Debug)]
pub enum AppendOutcome {
    /// A new message was committed under this id.
    Appended(SequenceId),
    /// The dedup token is already stored; carries the id it was stored under.
    Duplicate(SequenceId),
    /// Nothing was stored. The caller may retry with the same token.
    TransientFailure(StoreError),
}

/// Append-only message store keyed by client dedup token.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Stores `content` under `dedup_token` unless the token is already known.
    ///
    /// The uniqueness check and id assignment are atomic: two concurrent
    /// appends of one token produce exactly one `Appended` and one `Duplicate`.
    async fn append(&self, dedup_token: &str, content: &str) -> AppendOutcome;

    /// Every message with `sequence_id > offset` committed before the call,
    /// in ascending order.
    async fn read_from(&self, offset: SequenceId) -> Result<Vec<StoredMessage>, StoreError>;
}

#[cfg(test)]
mod tests;
