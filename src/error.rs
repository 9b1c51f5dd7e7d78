// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use crate::record::{BodyTooLarge, CorruptionError};
use crate::types::id::{PageId, RecordId, TxId};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Corruption(#[from] CorruptionError),

    /// The referenced record was never added or is already deleted.
    #[error("record {0} not found or already deleted")]
    NotFound(RecordId),

    #[error("invalid transaction {tx}: {reason}")]
    InvalidTransaction { tx: TxId, reason: &'static str },

    #[error("record of {size} bytes does not fit a journal file of {limit} bytes")]
    RecordTooLarge { size: usize, limit: u64 },

    #[error("invalid journal file {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },

    /// A write or sync failed earlier; the journal refuses work until reopened.
    #[error("journal failed after a write error, reopen required")]
    Failed,

    #[error("journal is closed")]
    Closed,
}

impl From<BodyTooLarge> for JournalError {
    fn from(err: BodyTooLarge) -> Self {
        JournalError::RecordTooLarge { size: err.size, limit: err.limit as u64 }
    }
}

impl JournalError {
    /// Copy of an I/O failure for fanning one error out to a whole batch.
    pub(crate) fn io_like(err: &io::Error) -> Self {
        JournalError::Io(io::Error::new(err.kind(), err.to_string()))
    }
}

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum PagingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Paging was switched off for the address after a page write failure.
    #[error("paging disabled for address {0}")]
    PagingDisabled(String),

    #[error("corrupt page entry in {address} page {page:?} at offset {offset}")]
    Corrupt { address: String, page: PageId, offset: u64 },

    /// The message journal refused a resident message or its deletion.
    #[error("message journal: {0}")]
    Journal(#[from] JournalError),

    #[error("address name of {0} bytes is too long")]
    AddressTooLong(usize),

    #[error("malformed message journal record {0:?}")]
    BadMessageRecord(RecordId),
}

pub type PagingResult<T> = Result<T, PagingError>;
