// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Live side of the replication link.
//!
//! The journal's record tap, the message journal's tap and the paging event
//! hook push [`Outbound`] items into a bounded queue in write order. One task
//! owns the connection: it dials the backup with backoff, runs a full
//! resynchronisation on every new session and then streams the queue,
//! skipping records the resync already carried. When the queue overflows the
//! dropped item is recovered by ending the session, so the next one starts
//! with a full resync.

use super::channel::{now_ms, Backoff, Liveness};
use super::codec::{CodecError, Frame, FrameCodec};
use super::ChannelStatus;
use crate::config::{ReplicationConfig, ReplicationMode, TimeoutPolicy};
use crate::errors::{NodeError, NodeResult};
use crate::failover::{FailoverCoordinator, Role};
use crate::telemetry;
use artemis_journal::{EventHook, Journal, JournalRecord, PagingEvent, PagingManager, RecordId, RecordTap};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Record(JournalRecord),
    MessageRecord(JournalRecord),
    PageWrite { address: String, sequence: u64, body: Vec<u8> },
    PageDepage { address: String, sequence: u64 },
    StepDown { epoch: u64 },
}

impl Outbound {
    fn into_frame(self) -> Frame {
        match self {
            Outbound::Record(record) => Frame::Record(record),
            Outbound::MessageRecord(record) => Frame::MessageRecord(record),
            Outbound::PageWrite { address, sequence, body } => Frame::PageWrite { address, sequence, body },
            Outbound::PageDepage { address, sequence } => Frame::PageDepage { address, sequence },
            Outbound::StepDown { epoch } => Frame::StepDown { epoch },
        }
    }
}

/// Producer end of the outbound queue. Pushing never blocks: a full queue
/// drops the item and flags the link for a full resync.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    overflowed: Arc<AtomicBool>,
}

impl OutboundQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, overflowed: Arc::new(AtomicBool::new(false)) }, rx)
    }

    pub fn push(&self, item: Outbound) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    metrics::increment_counter!(telemetry::QUEUE_OVERFLOWS);
                    tracing::warn!(capacity = self.tx.max_capacity(), "replication queue full, backup needs a full resync");
                }
            }
            // the receiver only goes away after stop()
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn clear_overflow(&self) {
        self.overflowed.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
enum SessionEnd {
    Stopped,
    PeerClosed,
    HeartbeatTimeout,
    /// Items were dropped from the full queue.
    Overflowed,
    /// The peer is not a backup.
    Refused(Role),
    /// This node stopped being a replication source.
    RoleChanged(Role),
}

/// Acks of one journal, plus the degraded marker of its synchronous waits.
struct AckStream {
    acks: watch::Sender<RecordId>,
    /// Record whose ack timed out under [`TimeoutPolicy::Degrade`]. Waits are
    /// skipped until the backup acks it. Zero when not degraded.
    degraded_at: AtomicU64,
}

impl AckStream {
    fn new() -> Self {
        Self { acks: watch::channel(RecordId::NONE).0, degraded_at: AtomicU64::new(0) }
    }

    fn record(&self, record: RecordId) {
        self.acks.send_if_modified(|acked| {
            if record <= *acked {
                return false;
            }
            *acked = record;
            true
        });
    }

    fn last(&self) -> RecordId {
        *self.acks.borrow()
    }
}

struct LinkState {
    records: AckStream,
    messages: AckStream,
    status: watch::Sender<ChannelStatus>,
    /// Epoch of a pending hand back, resent after every resync.
    step_down: Mutex<Option<u64>>,
}

impl LinkState {
    fn step_down(&self) -> Option<u64> {
        *self.step_down.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LiveReplicator {
    peer: SocketAddr,
    outbound: OutboundQueue,
    state: Arc<LinkState>,
    mode: ReplicationMode,
    ack_timeout: Duration,
    timeout_policy: TimeoutPolicy,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveReplicator {
    /// Starts dialing `peer` in the background.
    pub fn spawn(
        config: &ReplicationConfig,
        peer: SocketAddr,
        journal: Arc<Journal>,
        paging: Arc<PagingManager>,
        coordinator: Arc<FailoverCoordinator>,
    ) -> Arc<Self> {
        let (outbound, queue) = OutboundQueue::bounded(config.queue_capacity);
        let (stop, stop_rx) = watch::channel(false);
        let state = Arc::new(LinkState {
            records: AckStream::new(),
            messages: AckStream::new(),
            status: watch::channel(ChannelStatus::Disconnected).0,
            step_down: Mutex::new(None),
        });

        let link = Link {
            peer,
            config: config.clone(),
            journal,
            paging,
            coordinator,
            state: Arc::clone(&state),
            outbound: outbound.clone(),
        };
        let task = tokio::spawn(link.run(queue, stop_rx));

        Arc::new(Self {
            peer,
            outbound,
            state,
            mode: config.mode,
            ack_timeout: config.ack_timeout(),
            timeout_policy: config.timeout_policy,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues an item for the backup. Never blocks.
    pub fn send(&self, item: Outbound) {
        self.outbound.push(item);
    }

    /// Tap for [`Journal::set_record_tap`].
    pub fn record_tap(&self) -> RecordTap {
        let outbound = self.outbound.clone();
        Arc::new(move |record: &JournalRecord| outbound.push(Outbound::Record(record.clone())))
    }

    /// Tap for the paging store's message journal.
    pub fn message_tap(&self) -> RecordTap {
        let outbound = self.outbound.clone();
        Arc::new(move |record: &JournalRecord| outbound.push(Outbound::MessageRecord(record.clone())))
    }

    /// Hook for [`PagingManager::set_event_hook`].
    pub fn paging_hook(&self) -> EventHook {
        let outbound = self.outbound.clone();
        Arc::new(move |event: PagingEvent<'_>| {
            let item = match event {
                PagingEvent::Paged { address, sequence, body } => {
                    Outbound::PageWrite { address: address.to_string(), sequence, body: body.to_vec() }
                }
                PagingEvent::Depaged { address, sequence } => {
                    Outbound::PageDepage { address: address.to_string(), sequence }
                }
            };
            outbound.push(item);
        })
    }

    /// Hands leadership back: the backup takes over once it sees this. The
    /// frame is repeated after any resync until the replicator stops.
    pub fn step_down(&self, epoch: u64) {
        *self.state.step_down.lock().unwrap_or_else(PoisonError::into_inner) = Some(epoch);
        self.send(Outbound::StepDown { epoch });
    }

    pub fn last_acked(&self) -> RecordId {
        self.state.records.last()
    }

    pub fn last_message_acked(&self) -> RecordId {
        self.state.messages.last()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.state.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.state.status.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.records.degraded_at.load(Ordering::Acquire) != 0
            || self.state.messages.degraded_at.load(Ordering::Acquire) != 0
    }

    /// In synchronous mode, waits until the backup has applied `record`.
    ///
    /// On timeout the record is not resent. With [`TimeoutPolicy::Fail`] the
    /// caller gets [`NodeError::ReplicationTimeout`]; with
    /// [`TimeoutPolicy::Degrade`] the link behaves asynchronously until the
    /// backup catches up.
    pub async fn wait_for_ack(&self, record: RecordId) -> NodeResult<()> {
        self.wait_on(&self.state.records, record).await
    }

    /// Like [`wait_for_ack`](Self::wait_for_ack) for a record of the message
    /// journal.
    pub async fn wait_for_message_ack(&self, record: RecordId) -> NodeResult<()> {
        self.wait_on(&self.state.messages, record).await
    }

    async fn wait_on(&self, stream: &AckStream, record: RecordId) -> NodeResult<()> {
        if self.mode == ReplicationMode::Async {
            return Ok(());
        }

        let degraded_at = stream.degraded_at.load(Ordering::Acquire);
        if degraded_at != 0 {
            if stream.last().0 < degraded_at {
                return Ok(());
            }
            if stream.degraded_at.compare_exchange(degraded_at, 0, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                tracing::info!(peer = %self.peer, "backup caught up, synchronous replication resumed");
            }
        }

        let mut acks = stream.acks.subscribe();
        let acked = matches!(
            tokio::time::timeout(self.ack_timeout, acks.wait_for(|acked| *acked >= record)).await,
            Ok(Ok(_))
        );
        if acked {
            return Ok(());
        }

        metrics::increment_counter!(telemetry::REPLICATION_TIMEOUTS);
        match self.timeout_policy {
            TimeoutPolicy::Fail => {
                tracing::warn!(peer = %self.peer, %record, timeout_ms = self.ack_timeout.as_millis() as u64, "backup ack timed out");
                Err(NodeError::ReplicationTimeout { record })
            }
            TimeoutPolicy::Degrade => {
                stream.degraded_at.fetch_max(record.0, Ordering::AcqRel);
                tracing::warn!(peer = %self.peer, %record, "backup ack timed out, degrading to asynchronous replication");
                Ok(())
            }
        }
    }

    /// Waits, regardless of mode, until the backup has applied both journals
    /// up to the given ids. Returns false on timeout.
    pub async fn wait_for_catch_up(&self, record: RecordId, message: RecordId, timeout: Duration) -> bool {
        let mut records = self.state.records.acks.subscribe();
        let mut messages = self.state.messages.acks.subscribe();
        let caught_up = async {
            records.wait_for(|acked| *acked >= record).await.is_ok()
                && messages.wait_for(|acked| *acked >= message).await.is_ok()
        };
        matches!(tokio::time::timeout(timeout, caught_up).await, Ok(true))
    }

    /// Stops the link task. Queued items are dropped.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.state.status.send_replace(ChannelStatus::Disconnected);
    }
}

impl Drop for LiveReplicator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Link {
    peer: SocketAddr,
    config: ReplicationConfig,
    journal: Arc<Journal>,
    paging: Arc<PagingManager>,
    coordinator: Arc<FailoverCoordinator>,
    state: Arc<LinkState>,
    outbound: OutboundQueue,
}

type Connection = Framed<TcpStream, FrameCodec>;

/// Highest ids a session has put on the wire, per journal.
#[derive(Clone, Copy, Debug, Default)]
struct Sent {
    record: RecordId,
    message: RecordId,
}

impl Link {
    async fn run(self, mut queue: mpsc::Receiver<Outbound>, mut stop: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_initial_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        while !*stop.borrow() {
            match TcpStream::connect(self.peer).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(peer = %self.peer, "replication link connected");
                    match self.session(stream, &mut queue, &mut stop, &mut backoff).await {
                        Ok(SessionEnd::Overflowed) => {
                            tracing::info!(peer = %self.peer, "replication queue overflowed, resynchronising");
                            backoff.reset();
                        }
                        Ok(end) => tracing::info!(peer = %self.peer, ?end, "replication session ended"),
                        Err(e) => tracing::warn!(peer = %self.peer, error = %e, "replication session failed"),
                    }
                    self.set_status(ChannelStatus::Disconnected);
                }
                Err(e) => {
                    metrics::increment_counter!(telemetry::RECONNECT_ATTEMPTS);
                    tracing::debug!(peer = %self.peer, error = %e, "backup unreachable");
                }
            }

            // Anything queued while disconnected is covered by the next resync.
            let sleep = tokio::time::sleep(backoff.next_delay());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    item = queue.recv() => {
                        if item.is_none() {
                            return;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        let changed = self.state.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::info!(peer = %self.peer, ?status, "replication channel status");
            self.coordinator.channel_changed(status);
        }
    }

    async fn session(
        &self,
        stream: TcpStream,
        queue: &mut mpsc::Receiver<Outbound>,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> NodeResult<SessionEnd> {
        let mut conn = Framed::new(stream, FrameCodec);

        let role = self.coordinator.current_role();
        if !is_source(role) {
            return Ok(SessionEnd::RoleChanged(role));
        }
        conn.send(Frame::Announce {
            node: self.coordinator.node_id().to_string(),
            role,
            epoch: self.coordinator.epoch(),
        })
        .await?;

        let peer_role = match tokio::time::timeout(self.config.heartbeat_timeout(), conn.next()).await {
            Err(_) => return Ok(SessionEnd::HeartbeatTimeout),
            Ok(None) => return Ok(SessionEnd::PeerClosed),
            Ok(Some(frame)) => match frame? {
                Frame::Announce { node, role, epoch } => {
                    self.coordinator.peer_announced(&node, role, epoch);
                    role
                }
                _ => return Err(CodecError::Malformed("expected announce").into()),
            },
        };
        if !matches!(peer_role, Role::Backup | Role::Suspect) {
            return Ok(SessionEnd::Refused(peer_role));
        }
        let role = self.coordinator.current_role();
        if !is_source(role) {
            return Ok(SessionEnd::RoleChanged(role));
        }

        let mut sent = self.full_sync(&mut conn, queue).await?;
        tracing::info!(peer = %self.peer, last_record = %sent.record, last_message = %sent.message, "backup synchronised");
        self.set_status(ChannelStatus::Connected);
        backoff.reset();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut liveness = Liveness::new(self.config.heartbeat_timeout());

        loop {
            tokio::select! {
                item = queue.recv() => {
                    let Some(item) = item else { return Ok(SessionEnd::Stopped) };
                    if self.outbound.overflowed() {
                        return Ok(SessionEnd::Overflowed);
                    }
                    let fresh = match &item {
                        Outbound::Record(record) if record.id <= sent.record => false,
                        Outbound::Record(record) => {
                            sent.record = record.id;
                            metrics::increment_counter!(telemetry::RECORDS_REPLICATED);
                            true
                        }
                        Outbound::MessageRecord(record) if record.id <= sent.message => false,
                        Outbound::MessageRecord(record) => {
                            sent.message = record.id;
                            true
                        }
                        _ => true,
                    };
                    if fresh {
                        conn.send(item.into_frame()).await?;
                    }
                }
                frame = conn.next() => {
                    let Some(frame) = frame else { return Ok(SessionEnd::PeerClosed) };
                    liveness.touch();
                    match frame? {
                        Frame::Ack { record } => {
                            metrics::increment_counter!(telemetry::ACKS_RECEIVED);
                            self.state.records.record(record);
                        }
                        Frame::MessageAck { record } => self.state.messages.record(record),
                        Frame::Heartbeat { .. } => {}
                        Frame::Announce { node, role, epoch } => self.coordinator.peer_announced(&node, role, epoch),
                        other => tracing::warn!(peer = %self.peer, frame = ?other, "unexpected frame from backup"),
                    }
                }
                _ = heartbeat.tick() => {
                    if self.outbound.overflowed() {
                        return Ok(SessionEnd::Overflowed);
                    }
                    conn.send(Frame::Heartbeat { timestamp_ms: now_ms() }).await?;
                    let status = liveness.status();
                    self.set_status(status);
                    if status == ChannelStatus::Disconnected {
                        return Ok(SessionEnd::HeartbeatTimeout);
                    }
                    let role = self.coordinator.current_role();
                    if !is_source(role) {
                        return Ok(SessionEnd::RoleChanged(role));
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(SessionEnd::Stopped);
                    }
                }
            }
        }
    }

    /// Sends both journals and every paged message. Returns the highest ids
    /// sent.
    async fn full_sync(&self, conn: &mut Connection, queue: &mut mpsc::Receiver<Outbound>) -> NodeResult<Sent> {
        // Everything queued so far is already in a journal or page file.
        self.outbound.clear_overflow();
        while queue.try_recv().is_ok() {}
        conn.send(Frame::SyncBegin).await?;

        let journal = Arc::clone(&self.journal);
        let records = tokio::task::spawn_blocking(move || journal.replay().map(|replay| replay.collect::<Vec<_>>())).await??;
        let mut sent = Sent::default();
        let count = records.len();
        for record in records {
            sent.record = sent.record.max(record.id);
            conn.feed(Frame::Record(record)).await?;
        }

        let paging = Arc::clone(&self.paging);
        let (messages, paged) = tokio::task::spawn_blocking(move || -> NodeResult<_> {
            let messages = paging.message_journal().replay()?.collect::<Vec<_>>();
            Ok((messages, paging.export_paged()?))
        })
        .await??;
        let message_count = messages.len();
        for record in messages {
            sent.message = sent.message.max(record.id);
            conn.feed(Frame::MessageRecord(record)).await?;
        }
        let paged_count = paged.len();
        for message in paged {
            conn.feed(Frame::PageWrite { address: message.address, sequence: message.sequence, body: message.body }).await?;
        }

        conn.send(Frame::SyncEnd { last_record: sent.record, last_message: sent.message }).await?;
        tracing::debug!(peer = %self.peer, records = count, messages = message_count, paged = paged_count, "full synchronisation sent");

        if let Some(epoch) = self.state.step_down() {
            conn.send(Frame::StepDown { epoch }).await?;
        }
        Ok(sent)
    }
}

/// Roles that push their journal to the peer. A fenced node keeps dialing so
/// it can find its backup again.
fn is_source(role: Role) -> bool {
    matches!(role, Role::Live | Role::Promoted | Role::Fenced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_drops_item_and_flags_overflow() {
        let (queue, mut rx) = OutboundQueue::bounded(2);
        for sequence in 1..=3 {
            queue.push(Outbound::PageDepage { address: "q".into(), sequence });
        }
        assert!(queue.overflowed());

        let mut kept = Vec::new();
        while let Ok(item) = rx.try_recv() {
            kept.push(item);
        }
        assert_eq!(
            kept,
            vec![
                Outbound::PageDepage { address: "q".into(), sequence: 1 },
                Outbound::PageDepage { address: "q".into(), sequence: 2 },
            ]
        );

        queue.clear_overflow();
        queue.push(Outbound::StepDown { epoch: 1 });
        assert!(!queue.overflowed());
        assert_eq!(rx.try_recv().unwrap(), Outbound::StepDown { epoch: 1 });
    }

    #[test]
    fn test_push_after_receiver_dropped_is_ignored() {
        let (queue, rx) = OutboundQueue::bounded(1);
        drop(rx);
        queue.push(Outbound::StepDown { epoch: 2 });
        assert!(!queue.overflowed());
    }
}
