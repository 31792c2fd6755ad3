//! Broker engine
//!
//! This module contains the delivery-guarantee core shared by every gateway:
//! - ingestion: append to the durable log, classify the outcome, and hand new
//!   messages to the fan-out bus
//! - recovery replay: read the backlog a reconnecting client missed
//!
//! Concurrency and usage notes:
//! - `Broker` is cheap to clone and holds no per-connection state; the
//!   gateway keeps connections. All durability lives in the log.
//! - Nothing here returns an error to the caller. Transient failures are
//!   logged and turned into "no acknowledgment" (ingest) or "no replay"
//!   (replay); clients converge by retrying with the same dedup token or by
//!   reconnecting with their last offset.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{BusMessage, FanoutBus};
use crate::client::ConnectionMeta;
use crate::config::BrokerSettings;
use crate::persistence::{AppendOutcome, DurableLog, SequenceId, StoredMessage};

/// What the ingestion path decided for one publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Newly stored and handed to the bus.
    Accepted(SequenceId),
    Rejected(RejectReason),
    /// Transient store failure. No ack, no broadcast; the client retries.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Already stored under this id. Acknowledged, never re-broadcast.
    Duplicate(SequenceId),
    /// Malformed request; the log was not touched.
    Invalid(String),
}

impl IngestOutcome {
    /// The id to acknowledge the publisher with, if it should be acknowledged.
    pub fn ack_sequence_id(&self) -> Option<SequenceId> {
        match self {
            IngestOutcome::Accepted(id) => Some(*id),
            IngestOutcome::Rejected(RejectReason::Duplicate(id)) => Some(*id),
            IngestOutcome::Rejected(RejectReason::Invalid(_)) | IngestOutcome::Ignored => None,
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    log: Arc<dyn DurableLog>,
    bus: Arc<dyn FanoutBus>,
    max_content_bytes: usize,
}

impl Broker {
    pub fn new(
        log: Arc<dyn DurableLog>,
        bus: Arc<dyn FanoutBus>,
        settings: &BrokerSettings,
    ) -> Self {
        Self {
            log,
            bus,
            max_content_bytes: settings.max_content_bytes,
        }
    }

    pub fn bus(&self) -> &Arc<dyn FanoutBus> {
        &self.bus
    }

    /// Records one publish attempt from `connection_id`.
    ///
    /// The bus only ever sees a message after its append committed, and at
    /// most once per dedup token.
    pub async fn ingest(
        &self,
        connection_id: &str,
        dedup_token: &str,
        content: &str,
    ) -> IngestOutcome {
        if dedup_token.is_empty() {
            return IngestOutcome::Rejected(RejectReason::Invalid(
                "dedup_token must not be empty".to_string(),
            ));
        }
        if content.len() > self.max_content_bytes {
            return IngestOutcome::Rejected(RejectReason::Invalid(format!(
                "content exceeds {} bytes",
                self.max_content_bytes
            )));
        }

        match self.log.append(dedup_token, content).await {
            AppendOutcome::Appended(sequence_id) => {
                let message = BusMessage {
                    sequence_id,
                    content: content.to_string(),
                };
                // Already durable; a lost broadcast is recovered by replay.
                if let Err(e) = self.bus.publish(message).await {
                    warn!(connection_id, sequence_id, error = %e, "Fan-out publish failed");
                }
                info!(connection_id, sequence_id, "Accepted message");
                IngestOutcome::Accepted(sequence_id)
            }
            AppendOutcome::Duplicate(sequence_id) => {
                debug!(connection_id, sequence_id, dedup_token, "Duplicate submission acknowledged");
                IngestOutcome::Rejected(RejectReason::Duplicate(sequence_id))
            }
            AppendOutcome::TransientFailure(e) => {
                warn!(connection_id, dedup_token, error = %e, "Append failed; awaiting client retry");
                IngestOutcome::Ignored
            }
        }
    }

    /// Backlog for a newly established connection, ascending by sequence id.
    ///
    /// Recovered connections get nothing and cause no read. A failed read
    /// also yields nothing; the client keeps its gap until it reconnects.
    pub async fn replay(&self, connection_id: &str, meta: ConnectionMeta) -> Vec<StoredMessage> {
        if meta.recovered {
            debug!(connection_id, "Session recovered by transport; skipping replay");
            return Vec::new();
        }

        match self.log.read_from(meta.last_known_offset).await {
            Ok(messages) => {
                debug!(
                    connection_id,
                    offset = meta.last_known_offset,
                    count = messages.len(),
                    "Replaying backlog"
                );
                messages
            }
            Err(e) => {
                warn!(
                    connection_id,
                    offset = meta.last_known_offset,
                    error = %e,
                    "Replay read failed; connection continues without backlog"
                );
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("max_content_bytes", &self.max_content_bytes)
            .finish()
    }
}
