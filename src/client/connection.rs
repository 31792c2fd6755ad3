//! Connection representation
//!
//! `Client` models one live connection held by this process. It owns the
//! sending side of the per-connection channel drained by the connection's
//! writer task; everything pushed to a client, live or replayed, goes
//! through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::persistence::SequenceId;
use crate::transport::message::ServerMessage;

pub type ConnectionId = String;
pub type SessionId = String;

/// Connection-establishment metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Highest sequence id the client claims to have seen. `0` replays everything.
    pub last_known_offset: SequenceId,
    /// The transport restored the previous session, so replay is skipped.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub id: ConnectionId,
    pub session_id: SessionId,
    pub sender: UnboundedSender<ServerMessage>,
    /// Highest sequence id ever handed to this connection, delivered or not.
    queued_up_to: Arc<AtomicU64>,
}

impl Client {
    /// Create a new client with a sender channel. The `id` is a fresh UUID;
    /// `session_id` survives a recovered reconnect.
    pub fn new(session_id: SessionId, sender: UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            sender,
            queued_up_to: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues a `deliver` frame. Returns `false` if the writer is gone.
    pub fn deliver(&self, message: &BusMessage) -> bool {
        self.note_queued(message.sequence_id);
        self.send(ServerMessage::from(message))
    }

    /// Records that `sequence_id` was handed to this connection.
    pub fn note_queued(&self, sequence_id: SequenceId) {
        self.queued_up_to.fetch_max(sequence_id, Ordering::SeqCst);
    }

    /// The counter behind [`Client::queued_up_to`], shared with a detached
    /// session so it keeps counting until the connection is gone.
    pub(crate) fn queued_counter(&self) -> Arc<AtomicU64> {
        self.queued_up_to.clone()
    }

    pub fn queued_up_to(&self) -> SequenceId {
        self.queued_up_to.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// A fresh session id for a connection that is not resuming one.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}
