// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::ConfigError;
use crate::failover::Role;
use crate::replication::codec::CodecError;
use artemis_journal::{JournalError, PagingError, RecordId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("paging error: {0}")]
    Paging(#[from] PagingError),
    /// The record is durable locally; it is not resent.
    #[error("backup did not acknowledge record {record} in time")]
    ReplicationTimeout { record: RecordId },
    #[error("quorum lost, writes are fenced")]
    QuorumLost,
    #[error("node is {0:?} and does not accept writes")]
    NotLive(Role),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("replication protocol error: {0}")]
    Codec(#[from] CodecError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(e: tokio::task::JoinError) -> Self {
        NodeError::Task(e.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
