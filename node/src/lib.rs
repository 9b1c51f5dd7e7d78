// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod quorum;
pub mod failover;
pub mod replication;
pub mod broker;

pub use broker::BrokerNode;
pub use config::{NodeConfig, ReplicationConfig, FailoverConfig, ReplicationMode, StartupRole, TimeoutPolicy};
pub use errors::{NodeError, NodeResult};
pub use failover::{FailoverCoordinator, FailoverMachine, Role, RoleChange};
pub use quorum::{InMemoryQuorum, QuorumSignal};
pub use replication::{ChannelStatus, ReplicationState};
