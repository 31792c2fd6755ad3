//! Message log backed by `sled`
//!
//! Two trees make up the log:
//! - `messages`: big-endian sequence id -> JSON `StoredMessage`. Big-endian
//!   keys make sled's lexicographic order equal to sequence order, so replay
//!   is a plain range scan.
//! - `dedup`: dedup token -> big-endian sequence id it was stored under.
//!
//! Appends are serialized by a process-local lock; sled itself only allows
//! one process to open a database, which is why clustered workers go through
//! the coordinator instead of opening the log themselves.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult, abort};
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use super::{AppendOutcome, DurableLog, SequenceId, StoredMessage};
use crate::utils::StoreError;

const MESSAGES_TREE: &str = "messages";
const DEDUP_TREE: &str = "dedup";

#[derive(Clone)]
pub struct SledLog {
    inner: Arc<Inner>,
}

struct Inner {
    db: Db,
    messages: Tree,
    dedup: Tree,
    append_lock: Mutex<()>,
    sync_writes: bool,
}

impl SledLog {
    /// Open or create a log at `path`.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, sync_writes)
    }

    /// A log that lives only as long as the process. Used by tests and demos.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    fn from_db(db: Db, sync_writes: bool) -> Result<Self, StoreError> {
        let messages = db.open_tree(MESSAGES_TREE)?;
        let dedup = db.open_tree(DEDUP_TREE)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                messages,
                dedup,
                append_lock: Mutex::new(()),
                sync_writes,
            }),
        })
    }

    /// Highest committed sequence id, `0` for an empty log.
    pub fn last_sequence_id(&self) -> Result<SequenceId, StoreError> {
        Ok(self
            .inner
            .messages
            .last()?
            .map(|(key, _)| decode_sequence_id(&key))
            .unwrap_or(0))
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.inner.db.flush_async().await?;
        Ok(())
    }

    fn append_blocking(&self, dedup_token: &str, content: &str) -> AppendOutcome {
        // The guard protects no data, so a poisoned lock is still usable.
        let _guard = self
            .inner
            .append_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let next = match self.last_sequence_id() {
            Ok(last) => match last.checked_add(1) {
                Some(next) => next,
                None => return AppendOutcome::TransientFailure(StoreError::Exhausted),
            },
            Err(e) => return AppendOutcome::TransientFailure(e),
        };

        let message = StoredMessage {
            sequence_id: next,
            dedup_token: dedup_token.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let encoded = match serde_json::to_vec(&message) {
            Ok(data) => data,
            Err(e) => return AppendOutcome::TransientFailure(e.into()),
        };
        let key = next.to_be_bytes();

        let result: TransactionResult<(), SequenceId> = (&self.inner.messages, &self.inner.dedup)
            .transaction(|(messages, dedup)| {
                if let Some(existing) = dedup.get(dedup_token.as_bytes())? {
                    return abort(decode_sequence_id(&existing));
                }
                dedup.insert(dedup_token.as_bytes(), &key[..])?;
                messages.insert(&key[..], encoded.as_slice())?;
                Ok::<(), ConflictableTransactionError<SequenceId>>(())
            });

        match result {
            Ok(()) => {
                if self.inner.sync_writes {
                    // Committed regardless; this append still counts as new.
                    if let Err(e) = self.inner.db.flush() {
                        warn!(sequence_id = next, error = %e, "Flush after append failed");
                    }
                }
                debug!(sequence_id = next, dedup_token, "Appended message");
                AppendOutcome::Appended(next)
            }
            Err(TransactionError::Abort(existing)) => {
                debug!(sequence_id = existing, dedup_token, "Duplicate dedup token");
                AppendOutcome::Duplicate(existing)
            }
            Err(TransactionError::Storage(e)) => AppendOutcome::TransientFailure(e.into()),
        }
    }

    fn read_blocking(&self, offset: SequenceId) -> Result<Vec<StoredMessage>, StoreError> {
        let Some(start) = offset.checked_add(1) else {
            return Ok(Vec::new());
        };

        self.inner
            .messages
            .range(start.to_be_bytes()..)
            .map(|entry| -> Result<StoredMessage, StoreError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

/// Keys and dedup values are always written as 8 big-endian bytes.
fn decode_sequence_id(bytes: &[u8]) -> SequenceId {
    <[u8; 8]>::try_from(bytes)
        .map(SequenceId::from_be_bytes)
        .unwrap_or_default()
}

#[async_trait]
impl DurableLog for SledLog {
    async fn append(&self, dedup_token: &str, content: &str) -> AppendOutcome {
        let log = self.clone();
        let dedup_token = dedup_token.to_string();
        let content = content.to_string();

        match tokio::task::spawn_blocking(move || log.append_blocking(&dedup_token, &content)).await
        {
            Ok(outcome) => outcome,
            Err(e) => AppendOutcome::TransientFailure(e.into()),
        }
    }

    async fn read_from(&self, offset: SequenceId) -> Result<Vec<StoredMessage>, StoreError> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.read_blocking(offset)).await?
    }
}

impl std::fmt::Debug for SledLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledLog")
            .field("db", &"sled::Db")
            .field("sync_writes", &self.inner.sync_writes)
            .finish()
    }
}
