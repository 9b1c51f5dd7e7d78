// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use artemis_journal::paging::address_dir;
use artemis_journal::RecordEntry;
use artemis_node::config::{ReplicationMode, StartupRole};
use artemis_node::{BrokerNode, InMemoryQuorum};
use common::{eventually, init_tracing, loopback, node_config};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// A page write the backup cannot store keeps it out of sync: nothing after it
// counts as applied until a full copy succeeds.
#[tokio::test]
async fn test_failed_apply_forces_full_resync() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));

    let backup_dir = tempdir().unwrap();
    let mut backup_config = node_config("backup", StartupRole::Backup, backup_dir.path());
    backup_config.replication.listen = Some(loopback());
    // a file where the address directory should go
    let blocker = address_dir(&backup_config.paging, "blocked");
    std::fs::create_dir_all(&backup_config.paging.dir).unwrap();
    std::fs::write(&blocker, b"not a directory").unwrap();
    let backup = BrokerNode::start(backup_config, quorum.clone()).await.unwrap();

    let live_dir = tempdir().unwrap();
    let mut live_config = node_config("live", StartupRole::Live, live_dir.path());
    live_config.replication.peer = backup.replication_addr();
    live_config.replication.mode = ReplicationMode::Async;
    let live = BrokerNode::start(live_config, quorum.clone()).await.unwrap();

    live.append(RecordEntry::add(b"first".to_vec())).await.unwrap();
    eventually("initial sync", || backup.coordinator().is_synced()).await;

    live.paging().on_memory_pressure("blocked").unwrap();
    let outcome = live.send_message("blocked", b"paged".to_vec()).await.unwrap();
    assert!(outcome.paged);
    eventually("backup drops out of sync", || !backup.coordinator().is_synced()).await;

    // every resync hits the same page write
    let second = live.append(RecordEntry::add(b"second".to_vec())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!backup.coordinator().is_synced());
    assert!(backup.paging().stats("blocked").map_or(true, |stats| stats.paged_messages == 0));

    std::fs::remove_file(&blocker).unwrap();
    eventually("backup resynced", || backup.coordinator().is_synced()).await;
    assert!(backup.journal().contains(second));
    assert_eq!(backup.paging().stats("blocked").map(|stats| stats.paged_messages), Some(1));

    let live_set = live.replay_live_set().await.unwrap();
    let backup_set = backup.replay_live_set().await.unwrap();
    assert_eq!(live_set.digest(), backup_set.digest());

    live.shutdown().await.unwrap();
    backup.shutdown().await.unwrap();
}
