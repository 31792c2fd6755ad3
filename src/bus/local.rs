//! In-memory fan-out bus for standalone mode.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{BusMessage, BusReceiver, FanoutBus};
use crate::utils::BusError;

#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts skipping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        info!(capacity, "Local fan-out bus initialized");
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let sequence_id = message.sequence_id;
        // No receivers just means nobody is connected yet.
        match self.sender.send(message) {
            Ok(receivers) => debug!(sequence_id, receivers, "Published to local bus"),
            Err(_) => debug!(sequence_id, "Published to local bus with no receivers"),
        }
        Ok(())
    }

    fn subscribe(&self) -> BusReceiver {
        self.sender.subscribe()
    }
}
