// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The broker context: one journal, one paging store, one role.
//!
//! Storage calls are synchronous and run on the blocking pool. Every client
//! write asks the failover coordinator first; the role is never cached.
//! Client writes hold the write gate from that check until the local append
//! is done, so a node handing leadership back can wait for them to land.

use crate::config::NodeConfig;
use crate::errors::NodeResult;
use crate::failover::{FailoverCoordinator, Role, RoleChange};
use crate::quorum::QuorumSignal;
use crate::replication::{
    Acknowledger, BackupReceiver, ChannelStatus, LiveReplicator, ReplicatedEvent, ReplicationState,
};
use crate::telemetry;
use artemis_journal::journal::CompactionReport;
use artemis_journal::{
    Journal, JournalRecord, LiveSet, PagedMessage, PagingManager, PagingResult, RecordEntry, RecordId, StoreOutcome,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct BackupLink {
    acknowledger: Acknowledger,
    status: watch::Receiver<ChannelStatus>,
    local_addr: SocketAddr,
}

struct NodeInner {
    config: NodeConfig,
    journal: Arc<Journal>,
    paging: Arc<PagingManager>,
    coordinator: Arc<FailoverCoordinator>,
    replicator: Mutex<Option<Arc<LiveReplicator>>>,
    backup: Option<BackupLink>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writes: RwLock<()>,
    hand_back: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    fn replicator(&self) -> Option<Arc<LiveReplicator>> {
        self.replicator.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Starts streaming to the configured peer, if any and not already.
    fn start_replication(&self) {
        let Some(peer) = self.config.replication.peer else { return };
        let mut slot = self.replicator.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let replicator = LiveReplicator::spawn(
            &self.config.replication,
            peer,
            Arc::clone(&self.journal),
            Arc::clone(&self.paging),
            Arc::clone(&self.coordinator),
        );
        self.journal.set_record_tap(Some(replicator.record_tap()));
        self.paging.message_journal().set_record_tap(Some(replicator.message_tap()));
        self.paging.set_event_hook(Some(replicator.paging_hook()));
        tracing::info!(node = %self.config.node_id, %peer, mode = ?self.config.replication.mode, "replication started");
        *slot = Some(replicator);
    }

    fn stop_replication(&self) {
        let replicator = self.replicator.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(replicator) = replicator {
            self.journal.set_record_tap(None);
            self.paging.message_journal().set_record_tap(None);
            self.paging.set_event_hook(None);
            replicator.stop();
            tracing::info!(node = %self.config.node_id, "replication stopped");
        }
    }

    fn follow_role(self: &Arc<Self>, role: Role) {
        match role {
            Role::Live | Role::Fenced => self.start_replication(),
            Role::Promoted => {
                self.start_replication();
                if self.config.failover.failback {
                    self.spawn_hand_back();
                }
            }
            Role::Backup | Role::Suspect => self.stop_replication(),
        }
    }

    fn spawn_hand_back(self: &Arc<Self>) {
        let mut slot = self.hand_back.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(hand_back(Arc::downgrade(self))));
    }
}

/// Returns leadership to the replaced live node once it has rejoined as a
/// synced backup: fence, let in-flight writes land, wait for the backup to
/// apply everything, release the quorum, then tell the backup to take over.
async fn hand_back(weak: Weak<NodeInner>) {
    loop {
        let Some(replicator) = await_backup_link(&weak).await else { return };
        let Some(inner) = weak.upgrade() else { return };
        let Some(epoch) = inner.coordinator.begin_step_down() else { return };
        drop(inner.writes.write().await);

        let record = inner.journal.last_record_id();
        let message = inner.paging.message_journal().last_record_id();
        let timeout = inner.config.replication.ack_timeout();
        if !replicator.wait_for_catch_up(record, message, timeout).await {
            tracing::warn!(node = %inner.config.node_id, %record, %message, "backup did not catch up, keeping leadership");
            inner.coordinator.abort_step_down();
            continue;
        }
        if !inner.coordinator.release_leadership() {
            tracing::warn!(node = %inner.config.node_id, "quorum leadership was not held while handing back");
        }
        replicator.step_down(epoch);
        tracing::info!(node = %inner.config.node_id, epoch, "leadership handed back to the live node");
        return;
    }
}

/// Waits while the node is promoted until its replication link is connected.
async fn await_backup_link(weak: &Weak<NodeInner>) -> Option<Arc<LiveReplicator>> {
    let (mut roles, mut shutdown) = {
        let inner = weak.upgrade()?;
        (inner.coordinator.subscribe(), inner.shutdown.subscribe())
    };
    loop {
        if *shutdown.borrow() || *roles.borrow_and_update() != Role::Promoted {
            return None;
        }
        let replicator = weak.upgrade()?.replicator()?;
        let mut status = replicator.subscribe_status();
        if *status.borrow_and_update() == ChannelStatus::Connected {
            return Some(replicator);
        }
        tokio::select! {
            changed = status.changed() => changed.ok()?,
            changed = roles.changed() => changed.ok()?,
            _ = shutdown.changed() => return None,
        }
    }
}

/// A running broker node. Cheap to clone.
#[derive(Clone)]
pub struct BrokerNode {
    inner: Arc<NodeInner>,
}

impl BrokerNode {
    /// Opens storage, recovers it, and starts replication for the configured
    /// role.
    pub async fn start(config: NodeConfig, quorum: Arc<dyn QuorumSignal>) -> NodeResult<Self> {
        let journal_config = config.journal.clone();
        let (journal, report) = tokio::task::spawn_blocking(move || Journal::open(journal_config)).await??;
        tracing::info!(
            node = %config.node_id,
            records = report.records_replayed,
            live = report.live_records,
            next = %report.next_record_id,
            quarantined = report.quarantined.len(),
            in_doubt = report.in_doubt.len(),
            "journal recovered"
        );
        let journal = Arc::new(journal);

        let paging_config = config.paging.clone();
        let paging = Arc::new(tokio::task::spawn_blocking(move || PagingManager::open(paging_config)).await??);
        paging.set_failure_hook(|address, error| {
            metrics::increment_counter!(telemetry::PAGING_FAILURES);
            tracing::error!(%address, %error, "page write failed, address kept in memory");
        });

        let coordinator = FailoverCoordinator::new(config.node_id.clone(), config.role.into(), &config.failover, quorum);
        let (shutdown, _) = watch::channel(false);
        let mut tasks = vec![coordinator.spawn_monitor(shutdown.subscribe())];

        let backup = match config.replication.listen {
            Some(listen) => {
                let receiver =
                    BackupReceiver::bind(listen, &config.replication, Arc::clone(&coordinator), shutdown.subscribe())
                        .await?;
                let link = BackupLink {
                    acknowledger: receiver.acknowledger(),
                    status: receiver.status(),
                    local_addr: receiver.local_addr(),
                };
                let applier = Applier {
                    journal: Arc::clone(&journal),
                    paging: Arc::clone(&paging),
                    coordinator: Arc::clone(&coordinator),
                    acknowledger: receiver.acknowledger(),
                    broken: false,
                    resync_requested: false,
                };
                tasks.push(tokio::spawn(applier.run(receiver)));
                Some(link)
            }
            None => None,
        };

        let inner = Arc::new(NodeInner {
            config,
            journal,
            paging,
            coordinator,
            replicator: Mutex::new(None),
            backup,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            writes: RwLock::new(()),
            hand_back: Mutex::new(None),
        });
        inner.follow_role(inner.coordinator.current_role());
        tasks.push(spawn_role_watcher(&inner));
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        Ok(Self { inner })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    pub fn paging(&self) -> &Arc<PagingManager> {
        &self.inner.paging
    }

    /// Address the replication listener is bound to.
    pub fn replication_addr(&self) -> Option<SocketAddr> {
        self.inner.backup.as_ref().map(|link| link.local_addr)
    }

    pub async fn append(&self, entry: RecordEntry) -> NodeResult<RecordId> {
        Ok(self.append_record(entry).await?.id)
    }

    /// Appends `entry` and, in synchronous mode, waits for the backup.
    /// A replication timeout leaves the record durable locally.
    pub async fn append_record(&self, entry: RecordEntry) -> NodeResult<JournalRecord> {
        let gate = self.inner.writes.read().await;
        self.inner.coordinator.ensure_writable()?;
        let journal = Arc::clone(&self.inner.journal);
        let record = tokio::task::spawn_blocking(move || journal.append_record(entry)).await??;
        drop(gate);
        metrics::increment_counter!(telemetry::RECORDS_APPENDED);
        self.await_backup(record.id).await?;
        Ok(record)
    }

    pub async fn mark_deleted(&self, id: RecordId) -> NodeResult<RecordId> {
        let gate = self.inner.writes.read().await;
        self.inner.coordinator.ensure_writable()?;
        let journal = Arc::clone(&self.inner.journal);
        let tombstone = tokio::task::spawn_blocking(move || journal.mark_deleted(id)).await??;
        drop(gate);
        metrics::increment_counter!(telemetry::RECORDS_APPENDED);
        self.await_backup(tombstone).await?;
        Ok(tombstone)
    }

    async fn await_backup(&self, record: RecordId) -> NodeResult<()> {
        match self.inner.replicator() {
            Some(replicator) => replicator.wait_for_ack(record).await,
            None => Ok(()),
        }
    }

    async fn await_message_backup(&self, record: RecordId) -> NodeResult<()> {
        match self.inner.replicator() {
            Some(replicator) => replicator.wait_for_message_ack(record).await,
            None => Ok(()),
        }
    }

    pub async fn replay_live_set(&self) -> NodeResult<LiveSet> {
        let journal = Arc::clone(&self.inner.journal);
        let live = tokio::task::spawn_blocking(move || journal.replay().map(|replay| replay.into_live_set())).await??;
        Ok(live)
    }

    /// Stores a message for `address`. A resident message is journaled and,
    /// in synchronous mode, acknowledged by the backup before this returns.
    pub async fn send_message(&self, address: &str, body: impl Into<Vec<u8>>) -> NodeResult<StoreOutcome> {
        let gate = self.inner.writes.read().await;
        self.inner.coordinator.ensure_writable()?;
        let paging = Arc::clone(&self.inner.paging);
        let address = address.to_string();
        let body = body.into();
        let outcome = tokio::task::spawn_blocking(move || paging.send(&address, body)).await??;
        drop(gate);
        if let Some(record) = outcome.record {
            self.await_message_backup(record).await?;
        }
        Ok(outcome)
    }

    /// Next message for `address`, resident or paged.
    pub async fn next_message(&self, address: &str) -> NodeResult<Option<PagedMessage>> {
        self.take_message(address, PagingManager::next).await
    }

    pub async fn depage(&self, address: &str) -> NodeResult<Option<PagedMessage>> {
        self.take_message(address, PagingManager::depage).await
    }

    async fn take_message(
        &self,
        address: &str,
        take: fn(&PagingManager, &str) -> PagingResult<Option<PagedMessage>>,
    ) -> NodeResult<Option<PagedMessage>> {
        let gate = self.inner.writes.read().await;
        self.inner.coordinator.ensure_writable()?;
        let paging = Arc::clone(&self.inner.paging);
        let address = address.to_string();
        let (message, last) = tokio::task::spawn_blocking(move || {
            take(&paging, &address).map(|message| (message, paging.message_journal().last_record_id()))
        })
        .await??;
        drop(gate);
        if message.as_ref().is_some_and(|m| m.from_page.is_none()) {
            self.await_message_backup(last).await?;
        }
        Ok(message)
    }

    /// Compacts the record journal and the message journal.
    pub async fn compact(&self) -> NodeResult<CompactionReport> {
        let journal = Arc::clone(&self.inner.journal);
        let paging = Arc::clone(&self.inner.paging);
        let (report, messages) =
            tokio::task::spawn_blocking(move || journal.compact().and_then(|r| Ok((r, paging.compact_messages()?))))
                .await??;
        if !report.reclaimed.is_empty() || !messages.reclaimed.is_empty() {
            tracing::info!(
                node = %self.node_id(),
                reclaimed = report.reclaimed.len(),
                carried = report.records_carried,
                message_files = messages.reclaimed.len(),
                "journal compacted"
            );
        }
        Ok(report)
    }

    pub fn current_role(&self) -> Role {
        self.inner.coordinator.current_role()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.coordinator.epoch()
    }

    pub fn on_role_changed(&self, callback: impl Fn(RoleChange) + Send + Sync + 'static) {
        self.inner.coordinator.on_role_changed(callback);
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.inner.coordinator.subscribe()
    }

    /// Operator override of the role.
    pub fn reconfigure(&self, role: Role) {
        self.inner.coordinator.reconfigure(role);
    }

    pub fn coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.inner.coordinator
    }

    pub fn replication_state(&self) -> ReplicationState {
        let role = self.current_role();
        if let Some(replicator) = self.inner.replicator() {
            return ReplicationState {
                role,
                last_acked: replicator.last_acked(),
                channel_status: replicator.status(),
            };
        }
        match &self.inner.backup {
            Some(link) => ReplicationState {
                role,
                last_acked: link.acknowledger.last_acked(),
                channel_status: *link.status.borrow(),
            },
            None => ReplicationState { role, last_acked: RecordId::NONE, channel_status: ChannelStatus::Disconnected },
        }
    }

    /// Stops replication and background tasks. Storage closes when the last
    /// handle is dropped.
    pub async fn shutdown(&self) -> NodeResult<()> {
        self.inner.shutdown.send_replace(true);
        if let Some(task) = self.inner.hand_back.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.inner.stop_replication();
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!(node = %self.node_id(), "node stopped");
        Ok(())
    }
}

fn spawn_role_watcher(inner: &Arc<NodeInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let mut roles = inner.coordinator.subscribe();
    let mut shutdown = inner.shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            let role = *roles.borrow_and_update();
            let Some(inner) = weak.upgrade() else { break };
            inner.follow_role(role);
        }
    })
}

/// Applies what the live node streams to this node's storage.
///
/// After a failed apply nothing is acknowledged until the next full
/// synchronisation has started; the session is dropped so the live node
/// starts one.
struct Applier {
    journal: Arc<Journal>,
    paging: Arc<PagingManager>,
    coordinator: Arc<FailoverCoordinator>,
    acknowledger: Acknowledger,
    broken: bool,
    resync_requested: bool,
}

impl Applier {
    async fn run(mut self, mut receiver: BackupReceiver) {
        while let Some(event) = receiver.receive().await {
            let role = self.coordinator.current_role();
            if !matches!(role, Role::Backup | Role::Suspect) {
                tracing::debug!(?role, "dropping replicated event, node is not a backup");
                self.mark_broken();
                continue;
            }
            if self.broken && !matches!(event, ReplicatedEvent::SyncStarted) {
                if !self.resync_requested {
                    self.acknowledger.request_resync();
                    self.resync_requested = true;
                }
                continue;
            }
            if let Err(e) = self.apply(event).await {
                metrics::increment_counter!(telemetry::APPLY_FAILURES);
                tracing::error!(error = %e, "failed to apply replicated event, requesting full resynchronisation");
                self.mark_broken();
                self.coordinator.sync_lost();
                self.acknowledger.request_resync();
                self.resync_requested = true;
            }
        }
    }

    fn mark_broken(&mut self) {
        self.broken = true;
        self.resync_requested = false;
    }

    async fn apply(&mut self, event: ReplicatedEvent) -> NodeResult<()> {
        match event {
            ReplicatedEvent::SyncStarted => {
                self.coordinator.sync_started();
                let journal = Arc::clone(&self.journal);
                let paging = Arc::clone(&self.paging);
                tokio::task::spawn_blocking(move || -> NodeResult<()> {
                    journal.reset()?;
                    paging.reset()?;
                    Ok(())
                })
                .await??;
                self.acknowledger.reset();
                self.broken = false;
                self.resync_requested = false;
                tracing::info!("local state cleared for full synchronisation");
            }
            ReplicatedEvent::Record(record) => {
                let id = record.id;
                let journal = Arc::clone(&self.journal);
                tokio::task::spawn_blocking(move || journal.apply_replicated(record)).await??;
                self.acknowledger.ack(id);
            }
            ReplicatedEvent::MessageRecord(record) => {
                let id = record.id;
                let paging = Arc::clone(&self.paging);
                tokio::task::spawn_blocking(move || paging.apply_message_record(record)).await??;
                self.acknowledger.ack_message(id);
            }
            ReplicatedEvent::PageWrite { address, sequence, body } => {
                let paging = Arc::clone(&self.paging);
                let applied =
                    tokio::task::spawn_blocking(move || paging.apply_page_write(&address, sequence, &body)).await??;
                if !applied {
                    tracing::debug!(sequence, "page write already applied");
                }
            }
            ReplicatedEvent::PageDepage { address, sequence } => {
                let paging = Arc::clone(&self.paging);
                tokio::task::spawn_blocking(move || paging.apply_depage(&address, sequence)).await?;
            }
            ReplicatedEvent::SyncCompleted { last_record, last_message } => {
                self.acknowledger.ack(last_record);
                self.acknowledger.ack_message(last_message);
                self.coordinator.sync_completed();
                tracing::info!(%last_record, %last_message, "initial synchronisation complete");
            }
            ReplicatedEvent::PeerSteppedDown { epoch } => {
                tracing::info!(epoch, "live node stepped down");
                self.coordinator.peer_stepped_down(epoch);
            }
        }
        Ok(())
    }
}
