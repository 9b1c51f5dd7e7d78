// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use artemis_journal::RecordEntry;
use artemis_node::config::StartupRole;
use artemis_node::{BrokerNode, ChannelStatus, InMemoryQuorum, NodeError, Role};
use common::{eventually, init_tracing, loopback, node_config, TcpProxy};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct Pair {
    live: BrokerNode,
    backup: BrokerNode,
    proxy: TcpProxy,
    quorum: Arc<InMemoryQuorum>,
    _dirs: (TempDir, TempDir),
}

/// Live and backup connected through a proxy, with the backup fully synced.
async fn start_pair() -> Pair {
    init_tracing();
    let quorum = Arc::new(InMemoryQuorum::new(Some("live")));

    let backup_dir = tempdir().unwrap();
    let mut backup_config = node_config("backup", StartupRole::Backup, backup_dir.path());
    backup_config.replication.listen = Some(loopback());
    let backup = BrokerNode::start(backup_config, quorum.clone()).await.unwrap();

    let proxy = TcpProxy::start(backup.replication_addr().unwrap()).await;

    let live_dir = tempdir().unwrap();
    let mut live_config = node_config("live", StartupRole::Live, live_dir.path());
    live_config.replication.peer = Some(proxy.addr());
    let live = BrokerNode::start(live_config, quorum.clone()).await.unwrap();

    for n in 0..5u8 {
        live.append(RecordEntry::add(vec![n; 8])).await.unwrap();
    }
    assert_eq!(backup.replication_state().channel_status, ChannelStatus::Connected);

    Pair { live, backup, proxy, quorum, _dirs: (live_dir, backup_dir) }
}

// Live loses both its backup link and the quorum: the backup promotes after
// the grace period and the old live refuses writes, before and after it
// reconnects.
#[tokio::test]
async fn test_backup_promotes_and_old_live_stays_fenced() {
    let pair = start_pair().await;
    let changes = Arc::new(Mutex::new(Vec::new()));
    {
        let changes = changes.clone();
        pair.backup.on_role_changed(move |change| changes.lock().unwrap().push(change.to));
    }

    pair.quorum.partition("live");
    pair.proxy.cut();

    eventually("backup promotion", || pair.backup.current_role() == Role::Promoted).await;
    assert_eq!(*changes.lock().unwrap(), vec![Role::Suspect, Role::Promoted]);
    assert_eq!(pair.backup.epoch(), 1);
    assert_eq!(pair.quorum.holder().as_deref(), Some("backup"));

    let refused = pair.live.append(RecordEntry::add(b"late".to_vec())).await;
    assert!(matches!(refused, Err(NodeError::QuorumLost)));
    assert_eq!(pair.live.current_role(), Role::Fenced);

    // The promoted node serves writes with the replicated history.
    let id = pair.backup.append(RecordEntry::add(b"after failover".to_vec())).await.unwrap();
    assert_eq!(id.0, 6);

    // Old live comes back and learns about the newer epoch.
    pair.quorum.heal("live");
    pair.proxy.restore();
    eventually("old live learns the new epoch", || pair.live.epoch() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pair.live.current_role(), Role::Fenced);
    let refused = pair.live.append(RecordEntry::add(b"stale".to_vec())).await;
    assert!(matches!(refused, Err(NodeError::QuorumLost)));
    assert_eq!(pair.backup.current_role(), Role::Promoted);
}

// A link failure while the live node still holds the quorum is not a reason
// to promote.
#[tokio::test]
async fn test_link_loss_with_healthy_live_does_not_promote() {
    let pair = start_pair().await;

    pair.proxy.cut();
    eventually("backup notices the cut", || {
        pair.backup.replication_state().channel_status == ChannelStatus::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(pair.backup.current_role(), Role::Backup);
    assert_eq!(pair.live.current_role(), Role::Live);

    pair.proxy.restore();
    eventually("link restored", || pair.live.replication_state().channel_status == ChannelStatus::Connected).await;
    let id = pair.live.append(RecordEntry::add(b"still live".to_vec())).await.unwrap();
    assert!(pair.backup.journal().contains(id));
}

// Losing the quorum fences the live node even with a healthy link. It takes
// writes again once the quorum is back while its backup is still connected.
#[tokio::test]
async fn test_quorum_loss_fences_until_leadership_returns() {
    let pair = start_pair().await;

    pair.quorum.partition("live");
    eventually("live fenced", || pair.live.current_role() == Role::Fenced).await;
    assert!(matches!(
        pair.live.append(RecordEntry::add(b"x".to_vec())).await,
        Err(NodeError::QuorumLost)
    ));
    // the backup still hears heartbeats, so it stays put
    assert_eq!(pair.backup.current_role(), Role::Backup);

    pair.quorum.heal("live");
    eventually("live unfenced", || pair.live.current_role() == Role::Live).await;
    let id = pair.live.append(RecordEntry::add(b"y".to_vec())).await.unwrap();
    assert!(pair.backup.journal().contains(id));
}

// An operator can move a fenced node back by hand.
#[tokio::test]
async fn test_fenced_node_can_be_reconfigured() {
    let pair = start_pair().await;

    pair.proxy.cut();
    pair.quorum.partition("live");
    eventually("live fenced", || pair.live.current_role() == Role::Fenced).await;
    pair.quorum.heal("live");
    tokio::time::sleep(Duration::from_millis(200)).await;
    // no backup link, so leadership alone does not lift the fence
    assert_eq!(pair.live.current_role(), Role::Fenced);

    pair.live.reconfigure(Role::Live);
    assert_eq!(pair.live.current_role(), Role::Live);
    pair.proxy.restore();
    let id = pair.live.append(RecordEntry::add(b"z".to_vec())).await.unwrap();
    assert!(pair.backup.journal().contains(id));
}

// Resident messages the live node accepted, and the ones it consumed, carry
// over to the promoted backup.
#[tokio::test]
async fn test_resident_messages_survive_failover() {
    let pair = start_pair().await;
    for body in ["r1", "r2", "r3"] {
        let outcome = pair.live.send_message("orders", body.as_bytes().to_vec()).await.unwrap();
        assert!(!outcome.paged);
    }
    let first = pair.live.next_message("orders").await.unwrap().unwrap();
    assert_eq!(first.body, b"r1");

    pair.quorum.partition("live");
    pair.proxy.cut();
    eventually("backup promotion", || pair.backup.current_role() == Role::Promoted).await;

    let second = pair.backup.next_message("orders").await.unwrap().unwrap();
    let third = pair.backup.next_message("orders").await.unwrap().unwrap();
    assert_eq!((second.body.as_slice(), third.body.as_slice()), (&b"r2"[..], &b"r3"[..]));
    assert!(second.from_page.is_none());
    assert!(pair.backup.next_message("orders").await.unwrap().is_none());

    let outcome = pair.backup.send_message("orders", b"r4".to_vec()).await.unwrap();
    assert!(outcome.sequence > third.sequence);
}
