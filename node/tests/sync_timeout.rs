// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use artemis_journal::{RecordEntry, RecordId};
use artemis_node::config::{StartupRole, TimeoutPolicy};
use artemis_node::replication::{Frame, FrameCodec};
use artemis_node::{BrokerNode, InMemoryQuorum, NodeConfig, NodeError, Role};
use common::{init_tracing, loopback, node_config};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// A backup that completes the handshake and then never acks.
async fn silent_backup() -> (SocketAddr, mpsc::UnboundedReceiver<Frame>) {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut conn = Framed::new(stream, FrameCodec);
            match conn.next().await {
                Some(Ok(Frame::Announce { .. })) => {}
                other => panic!("expected announce, got {other:?}"),
            }
            conn.send(Frame::Announce { node: "silent".into(), role: Role::Backup, epoch: 0 }).await.unwrap();
            while let Some(Ok(frame)) = conn.next().await {
                let _ = seen_tx.send(frame);
            }
        }
    });

    (addr, seen)
}

fn live_config(dir: &Path, peer: SocketAddr, policy: TimeoutPolicy) -> NodeConfig {
    let mut config = node_config("live", StartupRole::Live, dir);
    config.replication.peer = Some(peer);
    config.replication.ack_timeout_ms = 300;
    config.replication.timeout_policy = policy;
    // the silent backup sends no heartbeats either
    config.replication.heartbeat_interval_ms = 1_000;
    config.replication.heartbeat_timeout_ms = 10_000;
    config
}

fn records_seen(seen: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<RecordId> {
    let mut ids = Vec::new();
    while let Ok(frame) = seen.try_recv() {
        if let Frame::Record(record) = frame {
            ids.push(record.id);
        }
    }
    ids
}

#[tokio::test]
async fn test_sync_append_times_out_without_resend() {
    init_tracing();
    let (peer, mut seen) = silent_backup().await;
    let dir = tempfile::tempdir().unwrap();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));
    let live = BrokerNode::start(live_config(dir.path(), peer, TimeoutPolicy::Fail), quorum).await.unwrap();

    let started = Instant::now();
    let result = live.append(RecordEntry::add(b"payment".to_vec())).await;
    assert!(matches!(result, Err(NodeError::ReplicationTimeout { record: RecordId(1) })));
    assert!(started.elapsed() >= Duration::from_millis(300));

    // durable locally despite the error
    assert!(live.journal().contains(RecordId(1)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(records_seen(&mut seen), vec![RecordId(1)]);

    // every later write fails the same way, each record sent once
    let result = live.append(RecordEntry::add(b"refund".to_vec())).await;
    assert!(matches!(result, Err(NodeError::ReplicationTimeout { record: RecordId(2) })));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(records_seen(&mut seen), vec![RecordId(2)]);
    assert_eq!(live.replication_state().last_acked, RecordId::NONE);
}

#[tokio::test]
async fn test_degrade_policy_stops_waiting_after_first_timeout() {
    init_tracing();
    let (peer, _seen) = silent_backup().await;
    let dir = tempfile::tempdir().unwrap();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));
    let live = BrokerNode::start(live_config(dir.path(), peer, TimeoutPolicy::Degrade), quorum).await.unwrap();

    let started = Instant::now();
    live.append(RecordEntry::add(b"a".to_vec())).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    let started = Instant::now();
    for _ in 0..5 {
        live.append(RecordEntry::add(b"b".to_vec())).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(live.journal().last_record_id(), RecordId(6));
}
