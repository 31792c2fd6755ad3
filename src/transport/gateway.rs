//! Connection gateway
//!
//! Owns the connections held by this process and is the only thing that
//! writes `deliver` frames to them. Responsibilities:
//! - register connections and run recovery replay when they are established
//! - route inbound publishes to the broker and acknowledge them
//! - drain the fan-out bus into every local connection (`deliver_local`)
//! - keep disconnected sessions around for a short window so a quick
//!   reconnect can be restored without replay (connection state recovery)
//!
//! A new connection is registered for live delivery before its replay read
//! starts. Live frames queue behind the backlog and any that the backlog
//! already covered are dropped by [`DeliveryCursor`], so nothing committed
//! during the read is lost and the backlog stays gap-free.
//!
//! A detached session remembers the highest sequence id its old connection
//! was handed. A reconnect only counts as recovered when the client's offset
//! has reached that id; otherwise frames may have died in the old socket and
//! the connection replays from its offset instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, IngestOutcome, RejectReason};
use crate::bus::{BusMessage, BusReceiver};
use crate::client::{Client, ConnectionId, ConnectionMeta, SessionId, new_session_id};
use crate::config::{RecoverySettings, Settings};
use crate::persistence::SequenceId;
use crate::transport::handshake::ConnectParams;
use crate::transport::message::ServerMessage;

#[derive(Debug)]
struct DetachedSession {
    buffered: Vec<BusMessage>,
    detached_at: Instant,
    /// Shared with the old connection until it is removed.
    queued_up_to: Arc<AtomicU64>,
}

/// A connection that has just been registered.
#[derive(Debug)]
pub struct Established {
    pub client: Client,
    pub meta: ConnectionMeta,
    /// Replayed or recovered frames, to be written before anything live.
    pub backlog: Vec<ServerMessage>,
    pub receiver: UnboundedReceiver<ServerMessage>,
}

impl Established {
    /// The session frame followed by the backlog.
    pub fn opening_frames(&mut self) -> Vec<ServerMessage> {
        let mut frames = Vec::with_capacity(self.backlog.len() + 1);
        frames.push(ServerMessage::Session {
            session_id: self.client.session_id.clone(),
            recovered: self.meta.recovered,
        });
        frames.append(&mut self.backlog);
        frames
    }
}

/// Splices live frames onto a backlog for one connection.
///
/// Bus order need not be sequence order, so a live frame is dropped only if
/// the client already has it: at or below its offset, or in the backlog.
#[derive(Debug, Default)]
pub struct DeliveryCursor {
    floor: SequenceId,
    backlog: HashSet<SequenceId>,
}

impl DeliveryCursor {
    pub fn after_backlog(last_known_offset: SequenceId, backlog: &[ServerMessage]) -> Self {
        Self {
            floor: last_known_offset,
            backlog: backlog
                .iter()
                .filter_map(ServerMessage::delivered_sequence_id)
                .collect(),
        }
    }

    /// Whether a queued live frame should still be written.
    pub fn admit(&self, frame: &ServerMessage) -> bool {
        match frame.delivered_sequence_id() {
            Some(id) => id > self.floor && !self.backlog.contains(&id),
            None => true,
        }
    }
}

pub struct Gateway {
    broker: Broker,
    connections: DashMap<ConnectionId, Client>,
    detached: DashMap<SessionId, DetachedSession>,
    recovery: RecoverySettings,
    live: AtomicUsize,
    max_connections: usize,
}

impl Gateway {
    pub fn new(broker: Broker, settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            broker,
            connections: DashMap::new(),
            detached: DashMap::new(),
            recovery: settings.recovery.clone(),
            live: AtomicUsize::new(0),
            max_connections: settings.server.max_connections,
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }

    /// Claims a connection slot, or `false` at `max_connections`.
    fn try_reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max_connections).then_some(live + 1)
            })
            .is_ok()
    }

    fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery.window_secs)
    }

    /// Registers a connection and computes what it must receive first.
    ///
    /// Returns `None` when the gateway is at `max_connections`.
    pub async fn establish(&self, params: ConnectParams) -> Option<Established> {
        if !self.try_reserve_slot() {
            return None;
        }
        let (tx, receiver) = mpsc::unbounded_channel();

        let resumable = params
            .session_id
            .filter(|session| self.recovery.enabled && self.detached.contains_key(session));
        let session_id = resumable.clone().unwrap_or_else(new_session_id);

        let client = Client::new(session_id, tx);
        // Live delivery must start before the detached buffer is taken or the
        // replay read begins; the cursor drops whatever overlaps.
        self.connections.insert(client.id.clone(), client.clone());

        let window = self.recovery_window();
        let offset = params.last_known_offset;
        let recovered_buffer = resumable.and_then(|session| {
            let (_, detached) = self.detached.remove(&session)?;
            if detached.detached_at.elapsed() > window {
                return None;
            }
            let handed = detached.queued_up_to.load(Ordering::SeqCst);
            if offset < handed {
                debug!(
                    session_id = %session,
                    offset,
                    handed,
                    "Client is behind its old connection; replaying instead"
                );
                return None;
            }
            Some(
                detached
                    .buffered
                    .into_iter()
                    .filter(|message| message.sequence_id > offset)
                    .collect::<Vec<_>>(),
            )
        });

        let meta = ConnectionMeta {
            last_known_offset: offset,
            recovered: recovered_buffer.is_some(),
        };

        let backlog: Vec<ServerMessage> = match recovered_buffer {
            Some(buffered) => buffered.iter().map(ServerMessage::from).collect(),
            None => self
                .broker
                .replay(&client.id, meta)
                .await
                .into_iter()
                .map(ServerMessage::from)
                .collect(),
        };
        for sequence_id in backlog.iter().filter_map(ServerMessage::delivered_sequence_id) {
            client.note_queued(sequence_id);
        }

        Some(Established {
            client,
            meta,
            backlog,
            receiver,
        })
    }

    /// Removes a closed connection, keeping its session resumable if enabled.
    pub fn disconnect(&self, connection_id: &str, session_id: &str) {
        if self.recovery.enabled {
            let queued_up_to = self
                .connections
                .get(connection_id)
                .map(|client| client.queued_counter());
            // Detach before removing so no broadcast falls between the two.
            if let Some(queued_up_to) = queued_up_to {
                self.detached.insert(
                    session_id.to_string(),
                    DetachedSession {
                        buffered: Vec::new(),
                        detached_at: Instant::now(),
                        queued_up_to,
                    },
                );
            }
        }
        if self.connections.remove(connection_id).is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(connection_id, session_id, "Connection closed");
    }

    /// Delivers one bus message to every local connection and buffers it for
    /// detached sessions. Returns the number of live connections reached.
    pub fn deliver_local(&self, message: &BusMessage) -> usize {
        // Buffer first: `establish` registers live before taking the buffer,
        // so a reattaching session is always covered by one of the two.
        if self.recovery.enabled {
            let max_buffered = self.recovery.max_buffered;
            self.detached.retain(|session_id, detached| {
                if detached.buffered.len() >= max_buffered {
                    debug!(%session_id, "Recovery buffer full; session will replay instead");
                    return false;
                }
                detached.buffered.push(message.clone());
                true
            });
        }

        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.value().deliver(message) {
                delivered += 1;
            } else {
                debug!(connection_id = %entry.key(), "Writer gone; dropping delivery");
            }
        }
        delivered
    }

    /// Runs ingestion for a publish from `client` and answers it.
    pub async fn handle_publish(
        &self,
        client: &Client,
        dedup_token: &str,
        content: &str,
    ) -> IngestOutcome {
        let outcome = self.broker.ingest(&client.id, dedup_token, content).await;

        if let Some(sequence_id) = outcome.ack_sequence_id() {
            client.send(ServerMessage::Ack {
                dedup_token: dedup_token.to_string(),
                sequence_id,
            });
        } else if let IngestOutcome::Rejected(RejectReason::Invalid(reason)) = &outcome {
            client.send(ServerMessage::Error {
                message: reason.clone(),
            });
        }

        outcome
    }

    /// Drops detached sessions older than the recovery window.
    pub fn sweep_expired(&self) -> usize {
        let window = self.recovery_window();
        let before = self.detached.len();
        self.detached
            .retain(|_, detached| detached.detached_at.elapsed() <= window);
        before.saturating_sub(self.detached.len())
    }

    /// Subscribes to the bus now and drains it into local connections until
    /// the bus closes.
    pub fn spawn_fanout(self: &Arc<Self>) -> JoinHandle<()> {
        let receiver = self.broker.bus().subscribe();
        tokio::spawn(run_fanout(self.clone(), receiver))
    }

    pub fn spawn_session_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.recovery.enabled {
            return None;
        }
        let gateway = self.clone();
        let period = Duration::from_secs((self.recovery.window_secs / 4).max(1));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let expired = gateway.sweep_expired();
                if expired > 0 {
                    debug!(expired, "Expired detached sessions");
                }
            }
        }))
    }
}

async fn run_fanout(gateway: Arc<Gateway>, mut receiver: BusReceiver) {
    info!("Fan-out consumer started");
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let delivered = gateway.deliver_local(&message);
                debug!(
                    sequence_id = message.sequence_id,
                    delivered, "Delivered to local connections"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Fan-out consumer lagged; clients resync on reconnect");
            }
            Err(RecvError::Closed) => {
                warn!("Fan-out bus closed; live delivery stopped");
                break;
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connections", &self.connections.len())
            .field("detached", &self.detached.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
