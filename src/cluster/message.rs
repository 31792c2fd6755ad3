//! Frames exchanged between workers and the coordinator.
//!
//! Requests carry a `request_id` chosen by the worker; the coordinator echoes
//! it on the reply. `broadcast` carries a committed message to every worker
//! and has no reply.

use serde::{Deserialize, Serialize};

use crate::bus::BusMessage;
use crate::persistence::{AppendOutcome, SequenceId, StoredMessage};
use crate::utils::StoreError;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Append {
        request_id: RequestId,
        dedup_token: String,
        content: String,
    },
    ReadFrom {
        request_id: RequestId,
        offset: SequenceId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    Appended {
        request_id: RequestId,
        outcome: RemoteAppend,
    },
    Replay {
        request_id: RequestId,
        result: RemoteRead,
    },
    Broadcast {
        sequence_id: SequenceId,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteAppend {
    Appended { sequence_id: SequenceId },
    Duplicate { sequence_id: SequenceId },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteRead {
    Ok { messages: Vec<StoredMessage> },
    Failed { reason: String },
}

impl From<AppendOutcome> for RemoteAppend {
    fn from(outcome: AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Appended(sequence_id) => RemoteAppend::Appended { sequence_id },
            AppendOutcome::Duplicate(sequence_id) => RemoteAppend::Duplicate { sequence_id },
            AppendOutcome::TransientFailure(e) => RemoteAppend::Failed {
                reason: e.to_string(),
            },
        }
    }
}

impl From<RemoteAppend> for AppendOutcome {
    fn from(remote: RemoteAppend) -> Self {
        match remote {
            RemoteAppend::Appended { sequence_id } => AppendOutcome::Appended(sequence_id),
            RemoteAppend::Duplicate { sequence_id } => AppendOutcome::Duplicate(sequence_id),
            RemoteAppend::Failed { reason } => {
                AppendOutcome::TransientFailure(StoreError::Remote(reason))
            }
        }
    }
}

impl From<Result<Vec<StoredMessage>, StoreError>> for RemoteRead {
    fn from(result: Result<Vec<StoredMessage>, StoreError>) -> Self {
        match result {
            Ok(messages) => RemoteRead::Ok { messages },
            Err(e) => RemoteRead::Failed {
                reason: e.to_string(),
            },
        }
    }
}

impl RemoteRead {
    pub fn into_result(self) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            RemoteRead::Ok { messages } => Ok(messages),
            RemoteRead::Failed { reason } => Err(StoreError::Remote(reason)),
        }
    }
}

impl From<BusMessage> for CoordinatorFrame {
    fn from(message: BusMessage) -> Self {
        CoordinatorFrame::Broadcast {
            sequence_id: message.sequence_id,
            content: message.content,
        }
    }
}
