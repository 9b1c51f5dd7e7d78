// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node configuration.
//!
//! Every setting can be supplied as a named option, which is how the broker's
//! configuration source hands them over. Unknown names are rejected rather
//! than ignored.

use artemis_journal::config::{InDoubtPolicy, JournalConfig, PagingConfig, SyncPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option {0}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue { name: String, value: String, reason: String },
}

/// Role a node takes when it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupRole {
    Live,
    Backup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Client writes wait for the backup's ack.
    Sync,
    /// Client writes return after the local sync; forwarding is best effort.
    Async,
}

/// What a synchronous write does when the backup's ack does not arrive in
/// time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutPolicy {
    Fail,
    /// Return success and stop waiting for acks until the backup catches up.
    Degrade,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Where a backup accepts its live node.
    pub listen: Option<SocketAddr>,
    /// Where a live node finds its backup.
    pub peer: Option<SocketAddr>,
    pub mode: ReplicationMode,
    pub ack_timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Items the outbound queue holds before an overflow forces a full
    /// resynchronisation.
    pub queue_capacity: usize,
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peer: None,
            mode: ReplicationMode::Sync,
            ack_timeout_ms: 5_000,
            timeout_policy: TimeoutPolicy::Fail,
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 2_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
            queue_capacity: 65_536,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// How long a backup stays suspect before it promotes itself.
    pub grace_period_ms: u64,
    /// Interval between quorum checks.
    pub quorum_poll_ms: u64,
    /// A fenced node rejoins as backup, and a promoted node hands leadership
    /// back once its backup has caught up.
    pub failback: bool,
}

impl FailoverConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn quorum_poll(&self) -> Duration {
        Duration::from_millis(self.quorum_poll_ms.max(1))
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { grace_period_ms: 3_000, quorum_poll_ms: 200, failback: false }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub role: StartupRole,
    pub journal: JournalConfig,
    pub paging: PagingConfig,
    pub replication: ReplicationConfig,
    pub failover: FailoverConfig,
}

impl NodeConfig {
    /// Configuration with journal and paging directories under `data_dir`.
    pub fn new(node_id: impl Into<String>, role: StartupRole, data_dir: &Path) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            journal: JournalConfig::new(data_dir.join("journal")),
            paging: PagingConfig::new(data_dir.join("paging")),
            replication: ReplicationConfig::default(),
            failover: FailoverConfig::default(),
        }
    }

    pub fn from_options<I, K, V>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.apply_option(name.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match name {
            "node.id" => {
                if value.is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.node_id = value.to_string();
            }
            "node.role" => {
                self.role = match value {
                    "live" => StartupRole::Live,
                    "backup" => StartupRole::Backup,
                    _ => return Err(invalid("expected live or backup")),
                }
            }
            "journal.directory" => self.journal.dir = PathBuf::from(value),
            "journal.file-size" => self.journal.file_size = parse(name, value)?,
            "journal.sync-mode" => {
                self.journal.sync = match (value, self.journal.sync) {
                    ("always", _) => SyncPolicy::EveryWrite,
                    ("batched", SyncPolicy::Batched { .. }) => self.journal.sync,
                    ("batched", SyncPolicy::EveryWrite) => SyncPolicy::default(),
                    _ => return Err(invalid("expected always or batched")),
                }
            }
            "journal.group-commit-delay-ms" => {
                let delay = parse(name, value)?;
                self.journal.sync = match self.journal.sync {
                    SyncPolicy::Batched { max_batch, .. } => SyncPolicy::Batched { max_delay_ms: delay, max_batch },
                    SyncPolicy::EveryWrite => SyncPolicy::Batched { max_delay_ms: delay, max_batch: 512 },
                }
            }
            "journal.group-commit-max-batch" => {
                let batch = parse(name, value)?;
                self.journal.sync = match self.journal.sync {
                    SyncPolicy::Batched { max_delay_ms, .. } => SyncPolicy::Batched { max_delay_ms, max_batch: batch },
                    SyncPolicy::EveryWrite => SyncPolicy::Batched { max_delay_ms: 2, max_batch: batch },
                }
            }
            "journal.compact-min-live-ratio" => {
                let ratio: f64 = parse(name, value)?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(invalid("expected a ratio between 0 and 1"));
                }
                self.journal.compaction.min_live_ratio = ratio;
            }
            "journal.compact-min-files" => self.journal.compaction.min_files = parse(name, value)?,
            "journal.auto-compact" => self.journal.compaction.auto = parse(name, value)?,
            "journal.in-doubt" => {
                self.journal.in_doubt = match value {
                    "hold" => InDoubtPolicy::Hold,
                    "commit" => InDoubtPolicy::Commit,
                    "rollback" => InDoubtPolicy::Rollback,
                    _ => return Err(invalid("expected hold, commit or rollback")),
                }
            }
            "paging.directory" => self.paging.dir = PathBuf::from(value),
            "paging.max-resident-messages" => self.paging.max_resident_messages = parse(name, value)?,
            "paging.max-resident-bytes" => self.paging.max_resident_bytes = parse(name, value)?,
            "paging.page-size" => self.paging.page_size = parse(name, value)?,
            "replication.listen" => self.replication.listen = Some(parse(name, value)?),
            "replication.peer" => self.replication.peer = Some(parse(name, value)?),
            "replication.mode" => {
                self.replication.mode = match value {
                    "sync" => ReplicationMode::Sync,
                    "async" => ReplicationMode::Async,
                    _ => return Err(invalid("expected sync or async")),
                }
            }
            "replication.ack-timeout-ms" => self.replication.ack_timeout_ms = parse(name, value)?,
            "replication.timeout-policy" => {
                self.replication.timeout_policy = match value {
                    "fail" => TimeoutPolicy::Fail,
                    "degrade" => TimeoutPolicy::Degrade,
                    _ => return Err(invalid("expected fail or degrade")),
                }
            }
            "replication.heartbeat-interval-ms" => self.replication.heartbeat_interval_ms = parse(name, value)?,
            "replication.heartbeat-timeout-ms" => self.replication.heartbeat_timeout_ms = parse(name, value)?,
            "replication.backoff-initial-ms" => self.replication.backoff_initial_ms = parse(name, value)?,
            "replication.backoff-max-ms" => self.replication.backoff_max_ms = parse(name, value)?,
            "replication.queue-capacity" => {
                let capacity: usize = parse(name, value)?;
                if capacity == 0 {
                    return Err(invalid("must be at least 1"));
                }
                self.replication.queue_capacity = capacity;
            }
            "failover.grace-period-ms" => self.failover.grace_period_ms = parse(name, value)?,
            "failover.quorum-poll-ms" => self.failover.quorum_poll_ms = parse(name, value)?,
            "failover.failback" => self.failover.failback = parse(name, value)?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("node-1", StartupRole::Live, Path::new("data"))
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
