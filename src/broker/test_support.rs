//! Test doubles for the log and bus seams.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::bus::{BusMessage, BusReceiver, FanoutBus, LocalBus};
use crate::config::BrokerSettings;
use crate::persistence::{AppendOutcome, DurableLog, SequenceId, SledLog, StoredMessage};
use crate::utils::{BusError, StoreError};

use super::Broker;

/// A real `SledLog` that can be told to fail, and counts reads.
#[derive(Clone)]
pub struct FlakyLog {
    inner: SledLog,
    fail_appends: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl FlakyLog {
    pub fn new() -> Self {
        Self {
            inner: SledLog::temporary().unwrap(),
            fail_appends: Arc::new(AtomicBool::new(false)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn sled(&self) -> &SledLog {
        &self.inner
    }
}

#[async_trait]
impl DurableLog for FlakyLog {
    async fn append(&self, dedup_token: &str, content: &str) -> AppendOutcome {
        if self.fail_appends.load(Ordering::SeqCst) {
            return AppendOutcome::TransientFailure(StoreError::Remote("injected".into()));
        }
        self.inner.append(dedup_token, content).await
    }

    async fn read_from(&self, offset: SequenceId) -> Result<Vec<StoredMessage>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("injected".into()));
        }
        self.inner.read_from(offset).await
    }
}

/// A `LocalBus` that also records every publish.
#[derive(Clone)]
pub struct RecordingBus {
    inner: LocalBus,
    published: Arc<Mutex<Vec<BusMessage>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self {
            inner: LocalBus::new(64),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl FanoutBus for RecordingBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        self.published.lock().unwrap().push(message.clone());
        self.inner.publish(message).await
    }

    fn subscribe(&self) -> BusReceiver {
        self.inner.subscribe()
    }
}

pub fn broker_settings() -> BrokerSettings {
    BrokerSettings {
        max_content_bytes: 1024,
        bus_capacity: 64,
    }
}

pub fn test_broker() -> (Broker, FlakyLog, RecordingBus) {
    let log = FlakyLog::new();
    let bus = RecordingBus::new();
    let broker = Broker::new(
        Arc::new(log.clone()),
        Arc::new(bus.clone()),
        &broker_settings(),
    );
    (broker, log, bus)
}
