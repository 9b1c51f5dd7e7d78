// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! artemis-journal: the durable storage core of a message broker.
//!
//! An append-only, checksummed journal of message, acknowledgement and
//! transaction records, plus a per-address paging store that spills message
//! bodies to disk under memory pressure. Replication and failover live in the
//! `artemis-node` crate and drive these types from an async runtime.

pub mod config;
pub mod error;
pub mod types;
pub mod record;
pub mod txn;
pub mod journal;
pub mod paging;

pub use config::{CompactionPolicy, InDoubtPolicy, JournalConfig, PagingConfig, SyncPolicy};
pub use error::{JournalError, JournalResult, PagingError, PagingResult};
pub use journal::{Journal, LiveSet, RecordTap, RecoveryReport, Replay};
pub use paging::{AddressMode, EventHook, PagedMessage, PagingEvent, PagingManager, StoreOutcome};
pub use record::{JournalRecord, RecordBody, RecordEntry};
pub use types::id::{FileId, RecordId, TxId};

#[cfg(test)]
pub mod tests;
