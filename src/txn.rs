// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Transaction contexts as seen from outside the journal.

use crate::types::enums::TxState;
use crate::types::id::{RecordId, TxId};
use std::collections::BTreeSet;

/// Snapshot of one open transaction.
///
/// A context exists from the first record staged under its id until the
/// Commit or Rollback record is durable; after that only the settled records
/// remain in the journal index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionContext {
    pub id: TxId,
    pub state: TxState,
    pub record_ids: BTreeSet<RecordId>,
}

/// A transaction found prepared but undecided when the journal was opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredTransaction {
    pub id: TxId,
    pub prepare_record: Option<RecordId>,
    pub record_ids: BTreeSet<RecordId>,
}

/// How an open-time transaction was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Incomplete when the process died; rolled back.
    RolledBackIncomplete,
    /// Prepared and committed by the in-doubt policy.
    Committed,
    /// Prepared and rolled back by the in-doubt policy.
    RolledBack,
    /// Prepared and left for the broker to decide.
    Held,
}
