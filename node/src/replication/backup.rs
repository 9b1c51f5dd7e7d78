// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Backup side of the replication link.
//!
//! The receiver forwards the live node's frames as [`ReplicatedEvent`]s and
//! reports back what the broker acknowledged. When the broker cannot apply an
//! event it asks for a resync: the current session is dropped and the live
//! node's next session starts with a full copy.

use super::channel::{now_ms, Liveness};
use super::codec::{CodecError, Frame, FrameCodec};
use super::ChannelStatus;
use crate::config::ReplicationConfig;
use crate::errors::NodeResult;
use crate::failover::{FailoverCoordinator, Role};
use artemis_journal::{JournalRecord, RecordId};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::Framed;

const EVENT_BUFFER: usize = 1024;

/// What the live node asked the backup to apply, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicatedEvent {
    /// Drop all local state; a full copy follows.
    SyncStarted,
    Record(JournalRecord),
    MessageRecord(JournalRecord),
    PageWrite { address: String, sequence: u64, body: Vec<u8> },
    PageDepage { address: String, sequence: u64 },
    SyncCompleted { last_record: RecordId, last_message: RecordId },
    /// The live node released leadership for this node to take over.
    PeerSteppedDown { epoch: u64 },
}

struct AckState {
    records: watch::Sender<RecordId>,
    messages: watch::Sender<RecordId>,
    /// Bumped to drop the current session.
    resyncs: watch::Sender<u64>,
}

fn advance(acks: &watch::Sender<RecordId>, record: RecordId) {
    acks.send_if_modified(|acked| {
        if record <= *acked {
            return false;
        }
        *acked = record;
        true
    });
}

/// Reports applied records back to the live node.
#[derive(Clone)]
pub struct Acknowledger {
    state: Arc<AckState>,
}

impl Acknowledger {
    /// Marks everything up to `record` as applied. Lower ids are ignored.
    pub fn ack(&self, record: RecordId) {
        advance(&self.state.records, record);
    }

    /// Like [`ack`](Self::ack) for the message journal.
    pub fn ack_message(&self, record: RecordId) {
        advance(&self.state.messages, record);
    }

    pub fn last_acked(&self) -> RecordId {
        *self.state.records.borrow()
    }

    pub fn last_message_acked(&self) -> RecordId {
        *self.state.messages.borrow()
    }

    /// Forgets what was acknowledged. Called once local state was cleared
    /// for a full copy, whose ids may be lower than the ones acked before.
    pub fn reset(&self) {
        self.state.records.send_replace(RecordId::NONE);
        self.state.messages.send_replace(RecordId::NONE);
    }

    /// Drops the current session so the live node reconnects with a full
    /// resynchronisation.
    pub fn request_resync(&self) {
        self.state.resyncs.send_modify(|generation| *generation += 1);
    }
}

pub struct BackupReceiver {
    events: mpsc::Receiver<ReplicatedEvent>,
    acknowledger: Acknowledger,
    status: watch::Receiver<ChannelStatus>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BackupReceiver {
    /// Listens on `listen` until `shutdown` flips. One session is served at a
    /// time; a new connection replaces the current one.
    pub async fn bind(
        listen: SocketAddr,
        config: &ReplicationConfig,
        coordinator: Arc<FailoverCoordinator>,
        shutdown: watch::Receiver<bool>,
    ) -> NodeResult<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(node = %coordinator.node_id(), %local_addr, "replication listener bound");

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let acks = Arc::new(AckState {
            records: watch::channel(RecordId::NONE).0,
            messages: watch::channel(RecordId::NONE).0,
            resyncs: watch::channel(0).0,
        });
        let (status_tx, status) = watch::channel(ChannelStatus::Disconnected);
        let inbound = Arc::new(Inbound {
            config: config.clone(),
            coordinator,
            events: events_tx,
            acks: Arc::clone(&acks),
            status: status_tx,
        });
        let task = tokio::spawn(accept_loop(listener, inbound, shutdown));

        Ok(Self { events, acknowledger: Acknowledger { state: acks }, status, local_addr, task })
    }

    /// Next event, or `None` once the listener has shut down.
    pub async fn receive(&mut self) -> Option<ReplicatedEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<ReplicatedEvent> {
        ReceiverStream::new(self.events)
    }

    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbound: Arc<Inbound>, mut shutdown: watch::Receiver<bool>) {
    let mut current: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    if let Some(previous) = current.take() {
                        previous.abort();
                    }
                    let inbound = Arc::clone(&inbound);
                    current = Some(tokio::spawn(async move { inbound.serve(stream, remote).await }));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "replication accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    if let Some(session) = current {
        session.abort();
    }
    tracing::debug!("replication listener stopped");
}

struct Inbound {
    config: ReplicationConfig,
    coordinator: Arc<FailoverCoordinator>,
    events: mpsc::Sender<ReplicatedEvent>,
    acks: Arc<AckState>,
    status: watch::Sender<ChannelStatus>,
}

impl Inbound {
    async fn serve(&self, stream: TcpStream, remote: SocketAddr) {
        match self.session(stream).await {
            Ok(reason) => tracing::info!(%remote, reason, "replication session closed"),
            Err(e) => tracing::warn!(%remote, error = %e, "replication session failed"),
        }
        self.set_status(ChannelStatus::Disconnected);
    }

    fn set_status(&self, status: ChannelStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::info!(?status, "replication channel status");
            self.coordinator.channel_changed(status);
        }
    }

    async fn session(&self, stream: TcpStream) -> NodeResult<&'static str> {
        let mut conn = Framed::new(stream, FrameCodec);

        let hello = tokio::time::timeout(self.config.heartbeat_timeout(), conn.next()).await;
        let (peer, peer_role) = match hello {
            Err(_) | Ok(None) => return Ok("no announce"),
            Ok(Some(frame)) => match frame? {
                Frame::Announce { node, role, epoch } => {
                    self.coordinator.peer_announced(&node, role, epoch);
                    (node, role)
                }
                _ => return Err(CodecError::Malformed("expected announce").into()),
            },
        };

        // Answer with our own role either way, so a stale live node learns
        // it has been replaced.
        let role = self.coordinator.current_role();
        conn.send(Frame::Announce {
            node: self.coordinator.node_id().to_string(),
            role,
            epoch: self.coordinator.epoch(),
        })
        .await?;
        if !matches!(role, Role::Backup | Role::Suspect) {
            tracing::warn!(%peer, ?role, "refusing replication, this node is not a backup");
            return Ok("not a backup");
        }
        if matches!(peer_role, Role::Backup | Role::Suspect) {
            tracing::warn!(%peer, ?peer_role, "refusing replication from another backup");
            return Ok("peer is a backup");
        }
        self.set_status(ChannelStatus::Connected);

        let mut acks = self.acks.records.subscribe();
        let mut message_acks = self.acks.messages.subscribe();
        let mut resyncs = self.acks.resyncs.subscribe();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut liveness = Liveness::new(self.config.heartbeat_timeout());

        loop {
            tokio::select! {
                frame = conn.next() => {
                    let Some(frame) = frame else { return Ok("peer closed") };
                    liveness.touch();
                    let event = match frame? {
                        Frame::SyncBegin => Some(ReplicatedEvent::SyncStarted),
                        Frame::Record(record) => Some(ReplicatedEvent::Record(record)),
                        Frame::MessageRecord(record) => Some(ReplicatedEvent::MessageRecord(record)),
                        Frame::PageWrite { address, sequence, body } => Some(ReplicatedEvent::PageWrite { address, sequence, body }),
                        Frame::PageDepage { address, sequence } => Some(ReplicatedEvent::PageDepage { address, sequence }),
                        Frame::SyncEnd { last_record, last_message } => {
                            Some(ReplicatedEvent::SyncCompleted { last_record, last_message })
                        }
                        Frame::StepDown { epoch } => Some(ReplicatedEvent::PeerSteppedDown { epoch }),
                        Frame::Heartbeat { .. } => None,
                        Frame::Announce { node, role, epoch } => {
                            self.coordinator.peer_announced(&node, role, epoch);
                            None
                        }
                        Frame::Ack { record } | Frame::MessageAck { record } => {
                            tracing::warn!(%peer, %record, "unexpected ack from live node");
                            None
                        }
                    };
                    if let Some(event) = event {
                        if self.events.send(event).await.is_err() {
                            return Ok("receiver dropped");
                        }
                    }
                }
                changed = acks.changed() => {
                    if changed.is_err() {
                        return Ok("acknowledger dropped");
                    }
                    let record = *acks.borrow_and_update();
                    conn.send(Frame::Ack { record }).await?;
                }
                changed = message_acks.changed() => {
                    if changed.is_err() {
                        return Ok("acknowledger dropped");
                    }
                    let record = *message_acks.borrow_and_update();
                    conn.send(Frame::MessageAck { record }).await?;
                }
                changed = resyncs.changed() => {
                    if changed.is_err() {
                        return Ok("acknowledger dropped");
                    }
                    return Ok("resynchronisation requested");
                }
                _ = heartbeat.tick() => {
                    conn.send(Frame::Heartbeat { timestamp_ms: now_ms() }).await?;
                    let status = liveness.status();
                    self.set_status(status);
                    if status == ChannelStatus::Disconnected {
                        return Ok("heartbeat timeout");
                    }
                }
            }
        }
    }
}
