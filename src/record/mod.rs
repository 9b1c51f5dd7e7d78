// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Journal records and their on-disk frame.
//!
//! Frame layout (little endian):
//!
//! ```text
//! [len: u32][kind: u8][txn: u64][record id: u64][target id: u64]?[data ...][crc32: u32]
//! ```
//!
//! `len` counts everything between itself and the checksum. The target id is
//! present for Update and Delete only. The checksum covers the length field
//! and the body, so a torn length prefix is caught as well as torn data.

pub mod encode;
pub mod decode;

pub use decode::{decode, decode_frame, CorruptionError, CorruptionKind};
pub use encode::{checked_len, encode, encode_into, encoded_len, BodyTooLarge};

use crate::types::enums::RecordKind;
use crate::types::id::{RecordId, TxId};

pub const LEN_PREFIX_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
/// kind + txn + record id
pub const BODY_HEADER_SIZE: usize = 1 + 8 + 8;
pub const FRAME_OVERHEAD: usize = LEN_PREFIX_SIZE + CHECKSUM_SIZE;
/// Upper bound on `len`; anything larger is treated as a corrupt prefix.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Kind-specific part of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordBody {
    Add { payload: Vec<u8> },
    Update { target: RecordId, payload: Vec<u8> },
    Delete { target: RecordId },
    Prepare { payload: Vec<u8> },
    Commit,
    Rollback,
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Add { .. } => RecordKind::Add,
            RecordBody::Update { .. } => RecordKind::Update,
            RecordBody::Delete { .. } => RecordKind::Delete,
            RecordBody::Prepare { .. } => RecordKind::Prepare,
            RecordBody::Commit => RecordKind::Commit,
            RecordBody::Rollback => RecordKind::Rollback,
        }
    }

    pub fn target(&self) -> Option<RecordId> {
        match self {
            RecordBody::Update { target, .. } | RecordBody::Delete { target } => Some(*target),
            _ => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            RecordBody::Add { payload }
            | RecordBody::Update { payload, .. }
            | RecordBody::Prepare { payload } => payload,
            _ => &[],
        }
    }
}

/// A journal record as stored and replicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JournalRecord {
    pub id: RecordId,
    pub tx: Option<TxId>,
    pub body: RecordBody,
}

impl JournalRecord {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    pub fn payload(&self) -> &[u8] {
        self.body.payload()
    }

    /// CRC-32 the record's frame carries.
    pub fn checksum(&self) -> u32 {
        encode::frame_checksum(self)
    }
}

/// A record before the journal assigns its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordEntry {
    pub tx: Option<TxId>,
    pub body: RecordBody,
}

impl RecordEntry {
    pub fn add(payload: impl Into<Vec<u8>>) -> Self {
        Self { tx: None, body: RecordBody::Add { payload: payload.into() } }
    }

    pub fn update(target: RecordId, payload: impl Into<Vec<u8>>) -> Self {
        Self { tx: None, body: RecordBody::Update { target, payload: payload.into() } }
    }

    pub fn delete(target: RecordId) -> Self {
        Self { tx: None, body: RecordBody::Delete { target } }
    }

    pub fn prepare(tx: TxId, payload: impl Into<Vec<u8>>) -> Self {
        Self { tx: Some(tx), body: RecordBody::Prepare { payload: payload.into() } }
    }

    pub fn commit(tx: TxId) -> Self {
        Self { tx: Some(tx), body: RecordBody::Commit }
    }

    pub fn rollback(tx: TxId) -> Self {
        Self { tx: Some(tx), body: RecordBody::Rollback }
    }

    /// Stage this Add/Update/Delete inside a transaction.
    pub fn in_tx(mut self, tx: TxId) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    pub(crate) fn into_record(self, id: RecordId) -> JournalRecord {
        JournalRecord { id, tx: self.tx, body: self.body }
    }
}
