// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Record, file and transaction enums.

use serde::{Deserialize, Serialize};

/// On-disk kind tag of a journal record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Add = 1,
    Update = 2,
    Delete = 3,
    Prepare = 4,
    Commit = 5,
    Rollback = 6,
}

impl RecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Add),
            2 => Some(RecordKind::Update),
            3 => Some(RecordKind::Delete),
            4 => Some(RecordKind::Prepare),
            5 => Some(RecordKind::Commit),
            6 => Some(RecordKind::Rollback),
            _ => None,
        }
    }

    /// Update and Delete carry the id of the record they refer to.
    pub fn has_target(&self) -> bool {
        matches!(self, RecordKind::Update | RecordKind::Delete)
    }

    /// Prepare, Commit and Rollback only make sense inside a transaction.
    pub fn is_transaction_marker(&self) -> bool {
        matches!(self, RecordKind::Prepare | RecordKind::Commit | RecordKind::Rollback)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileKind {
    /// Written by the appender, records in id order.
    Append = 1,
    /// Output of compaction, retained records sorted by id.
    Compacted = 2,
}

impl FileKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FileKind::Append),
            2 => Some(FileKind::Compacted),
            _ => None,
        }
    }
}

/// Lifecycle of a journal file. Only `Open` files receive appends; `Full`
/// files are immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    Open,
    Full,
    Compactable,
    Reclaimed,
}

impl Default for FileState {
    fn default() -> Self {
        FileState::Open
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}
