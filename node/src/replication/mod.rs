// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Point-to-point replication between a live node and its backup.
//!
//! The live side ([`live::LiveReplicator`]) dials the backup and streams
//! journal records and paging events over one TCP connection. The backup side
//! ([`backup::BackupReceiver`]) accepts it, hands the events to the broker and
//! sends acks back on the same connection.

pub mod backup;
pub mod channel;
pub mod codec;
pub mod live;

pub use backup::{Acknowledger, BackupReceiver, ReplicatedEvent};
pub use codec::{CodecError, Frame, FrameCodec};
pub use live::{LiveReplicator, Outbound};

use crate::failover::Role;
use artemis_journal::RecordId;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelStatus {
    Connected,
    /// Heartbeats are late.
    Degraded,
    Disconnected,
}

/// Snapshot of a node's replication link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicationState {
    pub role: Role,
    pub last_acked: RecordId,
    pub channel_status: ChannelStatus,
}
