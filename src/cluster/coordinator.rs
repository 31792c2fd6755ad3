//! Cluster coordinator
//!
//! Hosts the single message log and the bus hub for a multi-process
//! deployment. Each worker holds one WebSocket connection to it:
//! - `append` and `read_from` requests run against the log and are answered
//!   by `request_id`
//! - every newly committed message is broadcast to all attached workers, the
//!   appending one included, whether or not its reply reaches the worker

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::bus::{BusMessage, FanoutBus, LocalBus};
use crate::cluster::message::{CoordinatorFrame, WorkerFrame};
use crate::persistence::{AppendOutcome, DurableLog};
use crate::transport::message::encode_frame;
use crate::utils::RelayError;

pub struct Coordinator {
    log: Arc<dyn DurableLog>,
    bus: LocalBus,
    /// Held across append and publish so the bus sees ascending ids.
    commit_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(log: Arc<dyn DurableLog>, bus_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            log,
            bus: LocalBus::new(bus_capacity),
            commit_lock: Mutex::new(()),
        })
    }

    /// Appends and, for a new message, fans it out before the next commit.
    pub async fn commit(&self, dedup_token: &str, content: &str) -> AppendOutcome {
        let _guard = self.commit_lock.lock().await;
        let outcome = self.log.append(dedup_token, content).await;
        if let AppendOutcome::Appended(sequence_id) = &outcome {
            let message = BusMessage {
                sequence_id: *sequence_id,
                content: content.to_string(),
            };
            if let Err(e) = self.bus.publish(message).await {
                warn!(sequence_id, error = %e, "Coordinator fan-out failed");
            }
        }
        outcome
    }

    pub fn worker_count(&self) -> usize {
        self.bus.receiver_count()
    }

    pub async fn start(self: Arc<Self>, addr: &str) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        info!("Coordinator listening on ws://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept worker");
                    continue;
                }
            };
            spawn(self.clone().handle_worker(stream, peer));
        }
    }

    async fn handle_worker(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer, error = %e, "Worker handshake error");
                return;
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<CoordinatorFrame>();

        // Subscribe before reading anything so this worker sees its own commits.
        let mut broadcasts = self.bus.subscribe();
        info!(%peer, workers = self.worker_count(), "Worker attached");

        spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Some(msg) = encode_frame(&frame) {
                    if let Err(e) = ws_sender.send(msg).await {
                        debug!(%peer, error = %e, "Failed to send to worker");
                        break;
                    }
                }
            }
        });

        let forwarder = {
            let tx = tx.clone();
            spawn(async move {
                loop {
                    match broadcasts.recv().await {
                        Ok(message) => {
                            if tx.send(CoordinatorFrame::from(message)).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%peer, skipped, "Worker fell behind the bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text = match msg {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };

            match serde_json::from_str::<WorkerFrame>(text.as_str()) {
                Ok(WorkerFrame::Append {
                    request_id,
                    dedup_token,
                    content,
                }) => {
                    let coordinator = self.clone();
                    let tx = tx.clone();
                    spawn(async move {
                        let outcome = coordinator.commit(&dedup_token, &content).await;
                        let _ = tx.send(CoordinatorFrame::Appended {
                            request_id,
                            outcome: outcome.into(),
                        });
                    });
                }
                Ok(WorkerFrame::ReadFrom { request_id, offset }) => {
                    let log = self.log.clone();
                    let tx = tx.clone();
                    spawn(async move {
                        let result = log.read_from(offset).await;
                        let _ = tx.send(CoordinatorFrame::Replay {
                            request_id,
                            result: result.into(),
                        });
                    });
                }
                Err(err) => {
                    warn!(%peer, "Invalid worker frame: {err}");
                }
            }
        }

        forwarder.abort();
        info!(%peer, "Worker detached");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.worker_count())
            .finish()
    }
}
