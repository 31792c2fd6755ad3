//! Client protocol
//!
//! JSON text frames, internally tagged by `"type"`. `deliver` is used for
//! both live fan-out and recovery replay, so clients handle one shape and
//! track the highest `sequence_id` they have seen as their reconnect offset.

use serde::{Deserialize, Serialize};
use tracing::error;
use tungstenite::protocol::Message as WsMessage;

use crate::bus::BusMessage;
use crate::persistence::{SequenceId, StoredMessage};

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Retransmissions must reuse the same `dedup_token`.
    #[serde(rename = "publish")]
    Publish {
        content: String,
        #[serde(alias = "client_offset")]
        dedup_token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every connection.
    #[serde(rename = "session")]
    Session { session_id: String, recovered: bool },
    #[serde(rename = "deliver")]
    Deliver {
        content: String,
        sequence_id: SequenceId,
    },
    /// The publish identified by `dedup_token` is durably recorded.
    #[serde(rename = "ack")]
    Ack {
        dedup_token: String,
        sequence_id: SequenceId,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Sequence id of a `deliver` frame.
    pub fn delivered_sequence_id(&self) -> Option<SequenceId> {
        match self {
            ServerMessage::Deliver { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        }
    }
}

impl From<&BusMessage> for ServerMessage {
    fn from(message: &BusMessage) -> Self {
        ServerMessage::Deliver {
            content: message.content.clone(),
            sequence_id: message.sequence_id,
        }
    }
}

impl From<StoredMessage> for ServerMessage {
    fn from(message: StoredMessage) -> Self {
        ServerMessage::Deliver {
            content: message.content,
            sequence_id: message.sequence_id,
        }
    }
}

/// Encodes any protocol frame as a WebSocket text message.
pub(crate) fn encode_frame<T: Serialize>(frame: &T) -> Option<WsMessage> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(WsMessage::text(json)),
        Err(e) => {
            error!(error = %e, "Failed to serialize frame");
            None
        }
    }
}
