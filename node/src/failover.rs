// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Failover coordinator.
//!
//! [`FailoverMachine`] is the role state machine with no I/O and no clock of
//! its own; [`FailoverCoordinator`] feeds it channel status, quorum answers
//! and peer announcements, and publishes every transition. The coordinator is
//! the only place a node's role changes.
//!
//! With failback enabled a node that lost leadership to its peer rejoins as
//! that peer's backup, and a promoted node hands leadership back: it fences
//! itself, waits for the backup to catch up, releases the quorum and sends a
//! step-down, on which the backup acquires leadership and goes live.

use crate::config::{FailoverConfig, StartupRole};
use crate::errors::{NodeError, NodeResult};
use crate::quorum::QuorumSignal;
use crate::replication::ChannelStatus;
use crate::telemetry;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Live,
    Backup,
    /// Backup that lost its live node and is waiting out the grace period.
    Suspect,
    /// Former backup now serving writes.
    Promoted,
    /// Former live node that lost leadership. Refuses writes.
    Fenced,
}

impl Role {
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Role::Live | Role::Promoted)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Role::Live => 1,
            Role::Backup => 2,
            Role::Suspect => 3,
            Role::Promoted => 4,
            Role::Fenced => 5,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Role::Live),
            2 => Some(Role::Backup),
            3 => Some(Role::Suspect),
            4 => Some(Role::Promoted),
            5 => Some(Role::Fenced),
            _ => None,
        }
    }
}

impl From<StartupRole> for Role {
    fn from(role: StartupRole) -> Self {
        match role {
            StartupRole::Live => Role::Live,
            StartupRole::Backup => Role::Backup,
        }
    }
}

/// What the machine needs to hear from the quorum next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumQuery {
    Nothing,
    /// Does this node still hold leadership?
    OwnLeadership,
    /// Does the peer still hold leadership?
    PeerLeadership,
    /// Take leadership.
    Acquire,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailoverEvent {
    Channel(ChannelStatus),
    /// A full synchronisation started; local state is being replaced.
    SyncStarted,
    /// The backup finished a full synchronisation.
    SyncCompleted,
    OwnLeadership(bool),
    PeerLeadership(bool),
    Acquired(bool),
    PeerAnnounced { role: Role, epoch: u64 },
    /// Explicit operator reconfiguration.
    Reconfigure(Role),
    /// The promoted node starts handing leadership back.
    StepDownStarted,
    /// The hand back gave up before leadership was released.
    StepDownAborted,
    /// The peer released leadership for this node to take.
    PeerSteppedDown { epoch: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RoleChange {
    pub from: Role,
    pub to: Role,
    pub epoch: u64,
}

#[derive(Clone, Debug)]
pub struct FailoverMachine {
    role: Role,
    epoch: u64,
    channel: ChannelStatus,
    synced: bool,
    suspect_since: Option<Instant>,
    grace: Duration,
    failback: bool,
    /// Fenced on purpose while handing leadership back.
    handing_over: bool,
    /// The peer stepped down; acquire leadership next.
    takeover: bool,
}

impl FailoverMachine {
    pub fn new(role: Role, grace: Duration) -> Self {
        Self {
            role,
            epoch: 0,
            channel: ChannelStatus::Disconnected,
            synced: false,
            suspect_since: None,
            grace,
            failback: false,
            handing_over: false,
            takeover: false,
        }
    }

    pub fn with_failback(mut self, failback: bool) -> Self {
        self.failback = failback;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn channel(&self) -> ChannelStatus {
        self.channel
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_handing_over(&self) -> bool {
        self.handing_over
    }

    pub fn pending_query(&self, now: Instant) -> QuorumQuery {
        match self.role {
            Role::Backup | Role::Suspect if self.takeover => QuorumQuery::Acquire,
            Role::Live | Role::Promoted | Role::Fenced => QuorumQuery::OwnLeadership,
            Role::Backup if self.synced && self.channel == ChannelStatus::Disconnected => {
                QuorumQuery::PeerLeadership
            }
            Role::Backup => QuorumQuery::Nothing,
            Role::Suspect => match self.suspect_since {
                Some(since) if now.duration_since(since) >= self.grace => QuorumQuery::Acquire,
                _ => QuorumQuery::PeerLeadership,
            },
        }
    }

    pub fn handle(&mut self, event: FailoverEvent, now: Instant) -> Option<RoleChange> {
        let next = match (self.role, event) {
            (_, FailoverEvent::Reconfigure(role)) => {
                self.suspect_since = None;
                self.handing_over = false;
                self.takeover = false;
                if role == Role::Backup {
                    self.synced = false;
                }
                Some(role)
            }
            (_, FailoverEvent::Channel(status)) => {
                self.channel = status;
                match self.role {
                    Role::Suspect if status != ChannelStatus::Disconnected => {
                        self.suspect_since = None;
                        Some(Role::Backup)
                    }
                    _ => None,
                }
            }
            (Role::Backup | Role::Suspect, FailoverEvent::SyncStarted) => {
                self.synced = false;
                self.takeover = false;
                None
            }
            (Role::Backup, FailoverEvent::SyncCompleted) => {
                self.synced = true;
                None
            }
            (Role::Backup | Role::Suspect, FailoverEvent::PeerSteppedDown { epoch }) if self.synced => {
                self.epoch = self.epoch.max(epoch);
                self.takeover = true;
                None
            }
            (Role::Backup | Role::Suspect, FailoverEvent::Acquired(acquired)) if self.takeover => {
                self.takeover = false;
                if acquired {
                    self.epoch += 1;
                    self.suspect_since = None;
                    Some(Role::Live)
                } else {
                    None
                }
            }
            (Role::Promoted, FailoverEvent::StepDownStarted) if self.failback => {
                self.handing_over = true;
                Some(Role::Fenced)
            }
            (Role::Fenced, FailoverEvent::StepDownAborted) if self.handing_over => {
                self.handing_over = false;
                Some(Role::Promoted)
            }
            (Role::Live | Role::Promoted, FailoverEvent::OwnLeadership(false)) => Some(Role::Fenced),
            (Role::Fenced, FailoverEvent::OwnLeadership(true))
                if self.channel == ChannelStatus::Connected && !self.handing_over =>
            {
                Some(Role::Live)
            }
            (Role::Backup, FailoverEvent::PeerLeadership(false))
                if self.synced && self.channel == ChannelStatus::Disconnected =>
            {
                self.suspect_since = Some(now);
                Some(Role::Suspect)
            }
            (Role::Suspect, FailoverEvent::PeerLeadership(true)) => {
                self.suspect_since = None;
                Some(Role::Backup)
            }
            (Role::Suspect, FailoverEvent::Acquired(true)) => {
                self.epoch += 1;
                self.suspect_since = None;
                Some(Role::Promoted)
            }
            (Role::Live | Role::Promoted | Role::Fenced, FailoverEvent::PeerAnnounced { role, epoch })
                if role.accepts_writes() && epoch > self.epoch =>
            {
                self.epoch = epoch;
                if self.failback {
                    self.handing_over = false;
                    self.synced = false;
                    Some(Role::Backup)
                } else {
                    Some(Role::Fenced)
                }
            }
            (Role::Backup | Role::Suspect, FailoverEvent::PeerAnnounced { role, epoch }) if role.accepts_writes() => {
                self.epoch = self.epoch.max(epoch);
                None
            }
            _ => None,
        };

        match next {
            Some(to) if to != self.role => {
                let change = RoleChange { from: self.role, to, epoch: self.epoch };
                self.role = to;
                Some(change)
            }
            _ => None,
        }
    }
}

pub type RoleCallback = Arc<dyn Fn(RoleChange) + Send + Sync>;

/// Owner of a node's role.
pub struct FailoverCoordinator {
    node_id: String,
    peer_id: Mutex<Option<String>>,
    quorum: Arc<dyn QuorumSignal>,
    machine: Mutex<FailoverMachine>,
    roles: watch::Sender<Role>,
    callbacks: Mutex<Vec<RoleCallback>>,
    poll: Duration,
}

impl FailoverCoordinator {
    pub fn new(node_id: impl Into<String>, role: Role, config: &FailoverConfig, quorum: Arc<dyn QuorumSignal>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            peer_id: Mutex::new(None),
            quorum,
            machine: Mutex::new(FailoverMachine::new(role, config.grace_period()).with_failback(config.failback)),
            roles: watch::channel(role).0,
            callbacks: Mutex::new(Vec::new()),
            poll: config.quorum_poll(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, FailoverMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The role right now, read from the state machine.
    pub fn current_role(&self) -> Role {
        self.machine().role()
    }

    pub fn epoch(&self) -> u64 {
        self.machine().epoch()
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.roles.subscribe()
    }

    pub fn on_role_changed(&self, callback: impl Fn(RoleChange) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::new(callback));
    }

    /// Checks role and quorum for a client write.
    pub fn ensure_writable(&self) -> NodeResult<()> {
        let role = self.current_role();
        if role == Role::Fenced {
            return Err(NodeError::QuorumLost);
        }
        if !role.accepts_writes() {
            return Err(NodeError::NotLive(role));
        }
        if !self.quorum.has_leadership(&self.node_id) {
            self.apply(FailoverEvent::OwnLeadership(false));
            return Err(NodeError::QuorumLost);
        }
        Ok(())
    }

    pub fn channel_changed(&self, status: ChannelStatus) {
        self.apply(FailoverEvent::Channel(status));
    }

    pub fn sync_started(&self) {
        self.apply(FailoverEvent::SyncStarted);
    }

    /// The local copy is incomplete until the next full synchronisation.
    pub fn sync_lost(&self) {
        self.apply(FailoverEvent::SyncStarted);
    }

    pub fn sync_completed(&self) {
        self.apply(FailoverEvent::SyncCompleted);
    }

    /// Whether this backup holds a complete copy of its live node.
    pub fn is_synced(&self) -> bool {
        self.machine().is_synced()
    }

    /// Fences a promoted node to hand leadership back. Returns the epoch to
    /// announce, or `None` if the node is not promoted or failback is off.
    pub fn begin_step_down(&self) -> Option<u64> {
        self.apply(FailoverEvent::StepDownStarted);
        let machine = self.machine();
        machine.is_handing_over().then(|| machine.epoch())
    }

    pub fn abort_step_down(&self) {
        tracing::warn!(node = %self.node_id, "hand back aborted, keeping leadership");
        self.apply(FailoverEvent::StepDownAborted);
    }

    /// Gives the quorum's leadership up. Only meaningful while handing over.
    pub fn release_leadership(&self) -> bool {
        self.quorum.release(&self.node_id)
    }

    /// The peer handed leadership back; try to take it right away.
    pub fn peer_stepped_down(&self, epoch: u64) {
        tracing::info!(node = %self.node_id, epoch, "peer stepped down");
        self.apply(FailoverEvent::PeerSteppedDown { epoch });
        self.evaluate();
    }

    pub fn peer_announced(&self, peer: &str, role: Role, epoch: u64) {
        *self.peer_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer.to_string());
        self.apply(FailoverEvent::PeerAnnounced { role, epoch });
    }

    pub fn reconfigure(&self, role: Role) {
        tracing::warn!(node = %self.node_id, ?role, "role reconfigured by operator");
        self.apply(FailoverEvent::Reconfigure(role));
    }

    /// Push input for quorum services that notify on change.
    pub fn on_quorum_change(&self) {
        self.evaluate();
    }

    /// One round of quorum checks.
    pub fn evaluate(&self) {
        let query = self.machine().pending_query(Instant::now());
        let event = match query {
            QuorumQuery::Nothing => return,
            QuorumQuery::OwnLeadership => FailoverEvent::OwnLeadership(self.quorum.has_leadership(&self.node_id)),
            QuorumQuery::PeerLeadership => {
                let peer = self.peer_id.lock().unwrap_or_else(PoisonError::into_inner).clone();
                // a peer that never announced itself cannot be vouched for
                let leads = peer.map_or(false, |peer| self.quorum.has_leadership(&peer));
                FailoverEvent::PeerLeadership(leads)
            }
            QuorumQuery::Acquire => FailoverEvent::Acquired(self.quorum.try_acquire(&self.node_id)),
        };
        self.apply(event);
    }

    fn apply(&self, event: FailoverEvent) {
        let (change, handing_over) = {
            let mut machine = self.machine();
            let change = machine.handle(event, Instant::now());
            (change, machine.is_handing_over())
        };
        let Some(change) = change else { return };

        match change.to {
            Role::Fenced if handing_over => {
                tracing::info!(node = %self.node_id, epoch = change.epoch, "handing leadership back to the peer");
            }
            Role::Fenced => {
                metrics::increment_counter!(telemetry::FENCING_EVENTS);
                tracing::error!(node = %self.node_id, from = ?change.from, epoch = change.epoch, "leadership lost, refusing writes");
            }
            Role::Promoted => {
                tracing::warn!(node = %self.node_id, epoch = change.epoch, "backup promoted to live");
            }
            to => {
                tracing::info!(node = %self.node_id, from = ?change.from, ?to, epoch = change.epoch, "role changed");
            }
        }
        metrics::increment_counter!(telemetry::ROLE_CHANGES);

        self.roles.send_replace(change.to);
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for callback in callbacks {
            callback(change);
        }
    }

    /// Polls the quorum every `quorum_poll_ms`, and immediately on pushed
    /// quorum changes, until `shutdown` flips.
    pub fn spawn_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut changes = coordinator.quorum.subscribe();
            let mut ticker = tokio::time::interval(coordinator.poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = wait_for_change(&mut changes) => {
                        if !changed {
                            changes = None;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                coordinator.on_quorum_change();
            }
            tracing::debug!(node = %coordinator.node_id, "failover monitor stopped");
        })
    }
}

async fn wait_for_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
