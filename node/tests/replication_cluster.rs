// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use artemis_journal::{RecordEntry, RecordId};
use artemis_node::config::{ReplicationMode, StartupRole};
use artemis_node::{BrokerNode, ChannelStatus, InMemoryQuorum, NodeError, Role};
use common::{eventually, init_tracing, loopback, node_config};
use std::sync::Arc;
use tempfile::tempdir;

// Live and backup over loopback: journal records, paging events and acks.
#[tokio::test]
async fn test_replication_cluster() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));

    // ----------------------------------------------------------------
    // 1. Start BACKUP node
    // ----------------------------------------------------------------
    let backup_dir = tempdir().unwrap();
    let mut backup_config = node_config("backup", StartupRole::Backup, backup_dir.path());
    backup_config.replication.listen = Some(loopback());
    backup_config.paging.max_resident_messages = 1;
    let backup = BrokerNode::start(backup_config, quorum.clone()).await.unwrap();
    let backup_addr = backup.replication_addr().unwrap();

    // ----------------------------------------------------------------
    // 2. Start LIVE node pointed at the backup
    // ----------------------------------------------------------------
    let live_dir = tempdir().unwrap();
    let mut live_config = node_config("live", StartupRole::Live, live_dir.path());
    live_config.replication.peer = Some(backup_addr);
    live_config.paging.max_resident_messages = 1;
    let live = BrokerNode::start(live_config, quorum.clone()).await.unwrap();
    assert_eq!(live.current_role(), Role::Live);

    // ----------------------------------------------------------------
    // 3. Synchronous appends return once the backup applied them
    // ----------------------------------------------------------------
    let first = live.append(RecordEntry::add(b"order-1".to_vec())).await.unwrap();
    let second = live.append(RecordEntry::add(b"order-2".to_vec())).await.unwrap();
    let tombstone = live.mark_deleted(first).await.unwrap();
    assert_eq!((first, second, tombstone), (RecordId(1), RecordId(2), RecordId(3)));

    assert!(backup.journal().contains(second));
    assert_eq!(backup.journal().last_record_id(), RecordId(3));
    let state = live.replication_state();
    assert_eq!(state.last_acked, RecordId(3));
    assert_eq!(state.channel_status, ChannelStatus::Connected);

    let live_set = live.replay_live_set().await.unwrap();
    let backup_set = backup.replay_live_set().await.unwrap();
    assert_eq!(live_set.ids(), vec![RecordId(2)]);
    assert_eq!(live_set.digest(), backup_set.digest());

    // ----------------------------------------------------------------
    // 4. Paged messages and depages reach the backup
    // ----------------------------------------------------------------
    for body in ["m1", "m2", "m3"] {
        live.send_message("orders", body.as_bytes().to_vec()).await.unwrap();
    }
    eventually("paged messages on backup", || {
        backup.paging().stats("orders").map_or(false, |stats| stats.paged_messages == 2)
    })
    .await;

    let m1 = live.next_message("orders").await.unwrap().unwrap();
    let m2 = live.next_message("orders").await.unwrap().unwrap();
    assert_eq!((m1.body.as_slice(), m2.body.as_slice()), (&b"m1"[..], &b"m2"[..]));
    eventually("depage on backup", || {
        backup.paging().stats("orders").map_or(false, |stats| stats.paged_messages == 1)
    })
    .await;

    // ----------------------------------------------------------------
    // 5. The backup refuses client writes
    // ----------------------------------------------------------------
    let refused = backup.append(RecordEntry::add(b"nope".to_vec())).await;
    assert!(matches!(refused, Err(NodeError::NotLive(Role::Backup))));

    live.shutdown().await.unwrap();
    backup.shutdown().await.unwrap();
}

// A live node that starts first keeps dialing; the backup gets a full copy
// once it comes up.
#[tokio::test]
async fn test_late_backup_receives_full_copy() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));

    // reserve a port for the backup
    let backup_addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

    let live_dir = tempdir().unwrap();
    let mut live_config = node_config("live", StartupRole::Live, live_dir.path());
    live_config.replication.peer = Some(backup_addr);
    live_config.replication.mode = ReplicationMode::Async;
    let live = BrokerNode::start(live_config, quorum.clone()).await.unwrap();

    for i in 0..10u8 {
        live.append(RecordEntry::add(vec![i; 16])).await.unwrap();
    }
    live.mark_deleted(RecordId(4)).await.unwrap();
    assert_eq!(live.replication_state().channel_status, ChannelStatus::Disconnected);

    let backup_dir = tempdir().unwrap();
    let mut backup_config = node_config("backup", StartupRole::Backup, backup_dir.path());
    backup_config.replication.listen = Some(backup_addr);
    let backup = BrokerNode::start(backup_config, quorum.clone()).await.unwrap();

    eventually("backup catches up", || backup.journal().last_record_id() == RecordId(11)).await;
    eventually("live sees acks", || live.replication_state().last_acked == RecordId(11)).await;

    // streaming continues after the full copy
    let id = live.append(RecordEntry::add(b"after".to_vec())).await.unwrap();
    eventually("streamed record", || backup.journal().contains(id)).await;

    let live_set = live.replay_live_set().await.unwrap();
    let backup_set = backup.replay_live_set().await.unwrap();
    assert_eq!(live_set.len(), 10);
    assert_eq!(live_set.digest(), backup_set.digest());

    live.shutdown().await.unwrap();
    backup.shutdown().await.unwrap();
}

// A live node whose outbound queue overflows drops the session and sends a
// full copy instead of a stream with holes.
#[tokio::test]
async fn test_queue_overflow_falls_back_to_full_copy() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));

    let backup_dir = tempdir().unwrap();
    let mut backup_config = node_config("backup", StartupRole::Backup, backup_dir.path());
    backup_config.replication.listen = Some(loopback());
    let backup = BrokerNode::start(backup_config, quorum.clone()).await.unwrap();

    let live_dir = tempdir().unwrap();
    let mut live_config = node_config("live", StartupRole::Live, live_dir.path());
    live_config.replication.peer = backup.replication_addr();
    live_config.replication.mode = ReplicationMode::Async;
    live_config.replication.queue_capacity = 1;
    let live = BrokerNode::start(live_config, quorum.clone()).await.unwrap();

    let mut last = RecordId::NONE;
    for i in 0..200u32 {
        last = live.append(RecordEntry::add(i.to_le_bytes().to_vec())).await.unwrap();
    }
    for id in [3u64, 50, 120] {
        live.mark_deleted(RecordId(id)).await.unwrap();
    }
    live.send_message("orders", b"resident".to_vec()).await.unwrap();

    eventually("backup catches up", || backup.journal().last_record_id() == RecordId(last.0 + 3)).await;
    eventually("resident message mirrored", || {
        backup.paging().stats("orders").map_or(false, |stats| stats.resident_messages == 1)
    })
    .await;
    let live_set = live.replay_live_set().await.unwrap();
    let backup_set = backup.replay_live_set().await.unwrap();
    assert_eq!(live_set.len(), 197);
    assert_eq!(live_set.digest(), backup_set.digest());

    live.shutdown().await.unwrap();
    backup.shutdown().await.unwrap();
}
