//! Worker side of the cluster.
//!
//! A [`ClusterLink`] is one WebSocket connection to the coordinator that
//! stands in for both the message log and the fan-out bus of a worker
//! process. Log calls become correlated request/reply frames. The coordinator
//! broadcasts every commit itself, so publishing through the link only
//! acknowledges that; subscribers receive the `broadcast` frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::bus::{BusMessage, BusReceiver, FanoutBus};
use crate::cluster::message::{CoordinatorFrame, RequestId, WorkerFrame};
use crate::config::ClusterSettings;
use crate::persistence::{AppendOutcome, DurableLog, SequenceId, StoredMessage};
use crate::transport::message::encode_frame;
use crate::utils::{BusError, RelayError, StoreError};

/// State shared with the task reading coordinator frames.
struct Shared {
    pending: DashMap<RequestId, oneshot::Sender<CoordinatorFrame>>,
    closed: AtomicBool,
    broadcasts: Mutex<Option<broadcast::Sender<BusMessage>>>,
}

impl Shared {
    fn broadcasts(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<BusMessage>>> {
        self.broadcasts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, frame: CoordinatorFrame) {
        match frame {
            CoordinatorFrame::Broadcast {
                sequence_id,
                content,
            } => {
                if let Some(sender) = self.broadcasts().as_ref() {
                    let _ = sender.send(BusMessage {
                        sequence_id,
                        content,
                    });
                }
            }
            CoordinatorFrame::Appended { request_id, .. }
            | CoordinatorFrame::Replay { request_id, .. } => {
                match self.pending.remove(&request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(frame);
                    }
                    None => debug!(request_id, "Reply for an abandoned request"),
                }
            }
        }
    }

    /// Fails every waiter and closes local bus subscriptions.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.broadcasts().take();
        self.pending.clear();
    }
}

pub struct ClusterLink {
    outbound: mpsc::UnboundedSender<WorkerFrame>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    request_timeout_ms: u64,
}

impl ClusterLink {
    /// Dials the coordinator and starts the link's reader and writer tasks.
    pub async fn connect(
        settings: &ClusterSettings,
        bus_capacity: usize,
    ) -> Result<Arc<Self>, RelayError> {
        let url = if settings.coordinator_addr.starts_with("ws://") {
            settings.coordinator_addr.clone()
        } else {
            format!("ws://{}", settings.coordinator_addr)
        };
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!(%url, "Connected to coordinator");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<WorkerFrame>();
        let (broadcasts, _) = broadcast::channel(bus_capacity.max(1));

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            broadcasts: Mutex::new(Some(broadcasts)),
        });

        spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Some(msg) = encode_frame(&frame) {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!(error = %e, "Failed to send to coordinator");
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        {
            let shared = shared.clone();
            spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    let text = match msg {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "Coordinator connection failed");
                            break;
                        }
                    };
                    match serde_json::from_str::<CoordinatorFrame>(text.as_str()) {
                        Ok(frame) => shared.route(frame),
                        Err(err) => warn!("Invalid coordinator frame: {err}"),
                    }
                }
                shared.shut();
                warn!("Coordinator link closed");
            });
        }

        Ok(Arc::new(Self {
            outbound,
            shared,
            next_request: AtomicU64::new(1),
            request_timeout_ms: settings.request_timeout_ms,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> WorkerFrame,
    ) -> Result<CoordinatorFrame, StoreError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // Register before checking `closed`: `shut` sets the flag first, then
        // clears pending, so one of the two always catches a dead link.
        self.shared.pending.insert(request_id, tx);

        if self.is_closed() || self.outbound.send(build(request_id)).is_err() {
            self.shared.pending.remove(&request_id);
            return Err(StoreError::LinkClosed);
        }

        match timeout(Duration::from_millis(self.request_timeout_ms), rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(StoreError::LinkClosed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(StoreError::Timeout(self.request_timeout_ms))
            }
        }
    }
}

#[async_trait]
impl DurableLog for ClusterLink {
    async fn append(&self, dedup_token: &str, content: &str) -> AppendOutcome {
        let reply = self
            .request(|request_id| WorkerFrame::Append {
                request_id,
                dedup_token: dedup_token.to_string(),
                content: content.to_string(),
            })
            .await;

        match reply {
            Ok(CoordinatorFrame::Appended { outcome, .. }) => outcome.into(),
            Ok(other) => AppendOutcome::TransientFailure(StoreError::Remote(format!(
                "unexpected reply to append: {other:?}"
            ))),
            Err(e) => AppendOutcome::TransientFailure(e),
        }
    }

    async fn read_from(&self, offset: SequenceId) -> Result<Vec<StoredMessage>, StoreError> {
        match self
            .request(|request_id| WorkerFrame::ReadFrom { request_id, offset })
            .await?
        {
            CoordinatorFrame::Replay { result, .. } => result.into_result(),
            other => Err(StoreError::Remote(format!(
                "unexpected reply to read_from: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl FanoutBus for ClusterLink {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        debug!(
            sequence_id = message.sequence_id,
            "Fan-out handled by coordinator at commit"
        );
        Ok(())
    }

    fn subscribe(&self) -> BusReceiver {
        match self.shared.broadcasts().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Already closed: hand back a receiver that reports `Closed`.
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        }
    }
}

impl std::fmt::Debug for ClusterLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLink")
            .field("closed", &self.is_closed())
            .field("pending", &self.shared.pending.len())
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}
