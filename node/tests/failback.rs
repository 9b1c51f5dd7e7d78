// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use artemis_journal::{RecordEntry, RecordId};
use artemis_node::config::{NodeConfig, ReplicationMode, StartupRole};
use artemis_node::{BrokerNode, InMemoryQuorum, Role};
use common::{eventually, init_tracing, node_config};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn reserve_port() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn failback_config(id: &str, role: StartupRole, dir: &Path, listen: SocketAddr, peer: SocketAddr) -> NodeConfig {
    let mut config = node_config(id, role, dir);
    config.replication.listen = Some(listen);
    config.replication.peer = Some(peer);
    config.failover.failback = true;
    config
}

// The replaced live node restarts, rejoins as backup of the promoted node and
// takes leadership back once it holds everything written in between.
#[tokio::test]
async fn test_replaced_live_node_takes_leadership_back() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("a")));
    let (a_addr, b_addr) = (reserve_port(), reserve_port());
    let (a_dir, b_dir) = (tempdir().unwrap(), tempdir().unwrap());

    let mut b_config = failback_config("b", StartupRole::Backup, b_dir.path(), b_addr, a_addr);
    // no backup to wait for while "a" is down
    b_config.replication.mode = ReplicationMode::Async;
    let b = BrokerNode::start(b_config, quorum.clone()).await.unwrap();
    let a_config = failback_config("a", StartupRole::Live, a_dir.path(), a_addr, b_addr);
    let a = BrokerNode::start(a_config.clone(), quorum.clone()).await.unwrap();

    for n in 0..3u8 {
        a.append(RecordEntry::add(vec![n; 8])).await.unwrap();
    }
    a.send_message("orders", b"before".to_vec()).await.unwrap();
    eventually("b synced", || b.coordinator().is_synced()).await;

    a.shutdown().await.unwrap();
    drop(a);
    quorum.partition("a");
    eventually("b promoted", || b.current_role() == Role::Promoted).await;
    assert_eq!(b.epoch(), 1);
    let during = b.append(RecordEntry::add(b"while a was away".to_vec())).await.unwrap();
    assert_eq!(during, RecordId(4));
    b.send_message("orders", b"during".to_vec()).await.unwrap();

    quorum.heal("a");
    let a = BrokerNode::start(a_config, quorum.clone()).await.unwrap();

    eventually("a takes leadership back", || a.current_role() == Role::Live && a.epoch() == 2).await;
    eventually("b rejoins as backup", || b.current_role() == Role::Backup).await;
    assert_eq!(quorum.holder().as_deref(), Some("a"));
    assert!(a.journal().contains(during));
    assert_eq!(b.epoch(), 2);

    eventually("b synced with a", || b.coordinator().is_synced()).await;
    let id = a.append(RecordEntry::add(b"back home".to_vec())).await.unwrap();
    assert!(b.journal().contains(id));
    let a_set = a.replay_live_set().await.unwrap();
    let b_set = b.replay_live_set().await.unwrap();
    assert_eq!(a_set.len(), 5);
    assert_eq!(a_set.digest(), b_set.digest());

    let first = a.next_message("orders").await.unwrap().unwrap();
    let second = a.next_message("orders").await.unwrap().unwrap();
    assert_eq!((first.body.as_slice(), second.body.as_slice()), (&b"before"[..], &b"during"[..]));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// Without failback the replaced node stays fenced and the promoted node keeps
// leadership.
#[tokio::test]
async fn test_replaced_live_node_stays_fenced_without_failback() {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("a")));
    let (a_addr, b_addr) = (reserve_port(), reserve_port());
    let (a_dir, b_dir) = (tempdir().unwrap(), tempdir().unwrap());

    let mut b_config = failback_config("b", StartupRole::Backup, b_dir.path(), b_addr, a_addr);
    b_config.replication.mode = ReplicationMode::Async;
    b_config.failover.failback = false;
    let b = BrokerNode::start(b_config, quorum.clone()).await.unwrap();
    let mut a_config = failback_config("a", StartupRole::Live, a_dir.path(), a_addr, b_addr);
    a_config.failover.failback = false;
    let a = BrokerNode::start(a_config.clone(), quorum.clone()).await.unwrap();
    a.append(RecordEntry::add(b"one".to_vec())).await.unwrap();
    eventually("b synced", || b.coordinator().is_synced()).await;

    a.shutdown().await.unwrap();
    drop(a);
    quorum.partition("a");
    eventually("b promoted", || b.current_role() == Role::Promoted).await;

    quorum.heal("a");
    let a = BrokerNode::start(a_config, quorum.clone()).await.unwrap();
    eventually("a learns the new epoch", || a.epoch() == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(a.current_role(), Role::Fenced);
    assert_eq!(b.current_role(), Role::Promoted);
    assert_eq!(quorum.holder().as_deref(), Some("b"));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
