//! Broadcast fan-out bus.
//!
//! The bus carries every committed message to every gateway in the
//! deployment. Gateways never deliver a freshly ingested message directly;
//! they only deliver what they receive from the bus, so each connection
//! observes messages in bus order.
//!
//! Implementations:
//! - [`LocalBus`]: tokio broadcast channel, single process and tests
//! - [`ClusterLink`](crate::cluster::ClusterLink): forwards to the
//!   coordinator, which re-broadcasts to every worker

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::persistence::SequenceId;
use crate::utils::BusError;

pub use local::LocalBus;

/// Payload carried between processes and handed to each gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub sequence_id: SequenceId,
    pub content: String,
}

/// Receiving side of a bus subscription.
pub type BusReceiver = broadcast::Receiver<BusMessage>;

#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Hands a committed message to the bus. Returns once the bus has
    /// accepted it, not once remote gateways have delivered it.
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// A new receiver that sees every message published after this call.
    fn subscribe(&self) -> BusReceiver;
}
