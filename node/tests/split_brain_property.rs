// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Two failover machines sharing one quorum service, driven through random
//! partitions, link failures and clock advances. No round may end with two
//! nodes that accept writes.

use artemis_node::failover::{FailoverEvent, FailoverMachine, QuorumQuery};
use artemis_node::{ChannelStatus, InMemoryQuorum, QuorumSignal, Role};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const GRACE: Duration = Duration::from_millis(100);
const IDS: [&str; 2] = ["a", "b"];

#[derive(Clone, Debug)]
enum Step {
    Partition(usize),
    Heal(usize),
    LinkDown,
    LinkUp,
    Advance(u64),
    Poll,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..2).prop_map(Step::Partition),
        (0usize..2).prop_map(Step::Heal),
        Just(Step::LinkDown),
        Just(Step::LinkUp),
        (0u64..250).prop_map(Step::Advance),
        Just(Step::Poll),
        Just(Step::Poll),
    ]
}

struct Cluster {
    quorum: InMemoryQuorum,
    nodes: [FailoverMachine; 2],
    now: Instant,
    link_up: bool,
}

impl Cluster {
    fn new() -> Self {
        let now = Instant::now();
        let mut backup = FailoverMachine::new(Role::Backup, GRACE);
        backup.handle(FailoverEvent::Channel(ChannelStatus::Connected), now);
        backup.handle(FailoverEvent::SyncCompleted, now);
        backup.handle(FailoverEvent::PeerAnnounced { role: Role::Live, epoch: 0 }, now);
        let mut live = FailoverMachine::new(Role::Live, GRACE);
        live.handle(FailoverEvent::Channel(ChannelStatus::Connected), now);
        Self { quorum: InMemoryQuorum::new(Some("a")), nodes: [live, backup], now, link_up: true }
    }

    fn poll(&mut self, i: usize) {
        let event = match self.nodes[i].pending_query(self.now) {
            QuorumQuery::Nothing => return,
            QuorumQuery::OwnLeadership => FailoverEvent::OwnLeadership(self.quorum.has_leadership(IDS[i])),
            QuorumQuery::PeerLeadership => FailoverEvent::PeerLeadership(self.quorum.has_leadership(IDS[1 - i])),
            QuorumQuery::Acquire => FailoverEvent::Acquired(self.quorum.try_acquire(IDS[i])),
        };
        self.nodes[i].handle(event, self.now);
    }

    fn link_up(&mut self) {
        self.link_up = true;
        for i in 0..2 {
            let peer = &self.nodes[1 - i];
            let announced = FailoverEvent::PeerAnnounced { role: peer.role(), epoch: peer.epoch() };
            self.nodes[i].handle(announced, self.now);
        }
        // a session only comes up between a source and a backup
        let roles = [self.nodes[0].role(), self.nodes[1].role()];
        let is_backup = |r: Role| matches!(r, Role::Backup | Role::Suspect);
        if is_backup(roles[0]) != is_backup(roles[1]) {
            for node in &mut self.nodes {
                node.handle(FailoverEvent::Channel(ChannelStatus::Connected), self.now);
            }
        }
    }

    fn apply(&mut self, step: &Step) {
        match step {
            Step::Partition(i) => self.quorum.partition(IDS[*i]),
            Step::Heal(i) => self.quorum.heal(IDS[*i]),
            Step::LinkDown => {
                self.link_up = false;
                for node in &mut self.nodes {
                    node.handle(FailoverEvent::Channel(ChannelStatus::Disconnected), self.now);
                }
            }
            Step::LinkUp => self.link_up(),
            Step::Advance(ms) => self.now += Duration::from_millis(*ms),
            Step::Poll => {
                for i in [0, 1, 0, 1] {
                    self.poll(i);
                }
            }
        }
    }

    fn writable_roles(&self) -> usize {
        self.nodes.iter().filter(|node| node.role().accepts_writes()).count()
    }

    /// Nodes whose write check would pass: writable role and leadership.
    fn accepting(&self) -> usize {
        (0..2)
            .filter(|&i| self.nodes[i].role().accepts_writes() && self.quorum.has_leadership(IDS[i]))
            .count()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_at_most_one_node_accepts_writes(steps in proptest::collection::vec(step(), 1..60)) {
        let mut cluster = Cluster::new();
        for step in &steps {
            cluster.apply(step);
            prop_assert!(cluster.accepting() <= 1, "two nodes accept writes after {:?}", step);
            if matches!(step, Step::Poll) {
                prop_assert!(cluster.writable_roles() <= 1, "two writable roles after a poll round");
            }
        }
    }

    #[test]
    fn test_promotion_bumps_epoch(steps in proptest::collection::vec(step(), 1..60)) {
        let mut cluster = Cluster::new();
        for step in &steps {
            let before = cluster.nodes[1].role();
            cluster.apply(step);
            if before != Role::Promoted && cluster.nodes[1].role() == Role::Promoted {
                prop_assert!(cluster.nodes[1].epoch() >= 1);
                let holder = cluster.quorum.holder();
                prop_assert_eq!(holder.as_deref(), Some("b"));
            }
        }
    }
}
