// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-memory index rebuilt from the journal.
//!
//! Records are referenced by handle rather than held by value. For the live
//! journal the handle is a [`Location`] into a journal file, so retiring a
//! file is a bulk relocation of handles. Replay folds use the payload itself
//! as the handle to materialise a [`LiveSet`](super::replay::LiveSet).
//!
//! `apply` is lenient: references to records or transactions it has never
//! seen are counted as orphans instead of failing, because compaction drops
//! records whose effect is already settled. `validate` is the strict check
//! the appender runs before a record is written.

use crate::error::{JournalError, JournalResult};
use crate::record::{JournalRecord, RecordBody, RecordEntry};
use crate::txn::{RecoveredTransaction, TransactionContext};
use crate::types::enums::TxState;
use crate::types::id::{FileId, RecordId, TxId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;

/// Byte range of one frame inside a journal file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: FileId,
    pub offset: u64,
    pub len: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<H> {
    pub id: RecordId,
    pub handle: H,
}

#[derive(Clone, Debug)]
pub struct LiveRecord<H> {
    pub add: Entry<H>,
    pub updates: Vec<Entry<H>>,
}

/// A Delete that must stay on disk while the Add it cancels does.
#[derive(Clone, Debug)]
pub struct Tombstone<H> {
    pub delete: Entry<H>,
    pub add: Entry<H>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagedOp {
    Add,
    Update(RecordId),
    Delete(RecordId),
}

impl StagedOp {
    fn of(body: &RecordBody) -> Option<Self> {
        match body {
            RecordBody::Add { .. } => Some(StagedOp::Add),
            RecordBody::Update { target, .. } => Some(StagedOp::Update(*target)),
            RecordBody::Delete { target } => Some(StagedOp::Delete(*target)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenTx<H> {
    pub state: TxState,
    pub ops: Vec<(StagedOp, Entry<H>)>,
    pub prepare: Option<Entry<H>>,
}

impl<H> OpenTx<H> {
    fn new() -> Self {
        Self { state: TxState::Active, ops: Vec::new(), prepare: None }
    }

    fn entries(self) -> Vec<Entry<H>> {
        let mut out: Vec<Entry<H>> = self.ops.into_iter().map(|(_, e)| e).collect();
        out.extend(self.prepare);
        out
    }
}

/// A finished transaction whose transactional records are still on disk.
/// The terminal record has to outlive them or replay would see the
/// transaction as incomplete.
#[derive(Clone, Debug)]
pub struct SettledTx<H> {
    pub tx: TxId,
    pub outcome: TxState,
    pub records: Vec<Entry<H>>,
    pub terminal: Entry<H>,
}

/// Where a record ended up after compaction.
#[derive(Clone, Copy, Debug)]
pub struct Moved {
    pub loc: Location,
    /// The rewritten frame still carries its transaction id.
    pub tx_form: bool,
}

#[derive(Clone, Debug)]
pub struct RecordIndex<H> {
    pub live: FxHashMap<RecordId, LiveRecord<H>>,
    pub tombstones: FxHashMap<RecordId, Tombstone<H>>,
    pub open: BTreeMap<TxId, OpenTx<H>>,
    pub settled: BTreeMap<RecordId, SettledTx<H>>,
    pending_deletes: FxHashSet<RecordId>,
    pub orphans: u64,
}

impl<H> Default for RecordIndex<H> {
    fn default() -> Self {
        Self {
            live: FxHashMap::default(),
            tombstones: FxHashMap::default(),
            open: BTreeMap::new(),
            settled: BTreeMap::new(),
            pending_deletes: FxHashSet::default(),
            orphans: 0,
        }
    }
}

/// What records accepted earlier in the current write batch change about
/// validation. The index itself only sees a batch once it is durable.
#[derive(Debug, Default)]
pub struct BatchOverlay {
    consumed: FxHashSet<RecordId>,
    /// `None` marks a transaction the batch already committed or rolled back.
    tx_states: FxHashMap<TxId, Option<TxState>>,
}

impl BatchOverlay {
    pub fn note(&mut self, record: &JournalRecord) {
        if let RecordBody::Delete { target } = record.body {
            self.consumed.insert(target);
        }
        let Some(tx) = record.tx else {
            return;
        };
        match record.body {
            RecordBody::Prepare { .. } => {
                self.tx_states.insert(tx, Some(TxState::Prepared));
            }
            RecordBody::Commit | RecordBody::Rollback => {
                self.tx_states.insert(tx, None);
            }
            _ => {
                let state = self.tx_states.entry(tx).or_insert(None);
                if state.is_none() {
                    *state = Some(TxState::Active);
                }
            }
        }
    }
}

impl<H: Clone> RecordIndex<H> {
    /// Strict check for a record about to be appended.
    pub fn validate(&self, entry: &RecordEntry) -> JournalResult<()> {
        self.validate_in_batch(entry, &BatchOverlay::default())
    }

    /// [`validate`](Self::validate) for an entry that follows the records
    /// noted in `batch`.
    pub fn validate_in_batch(&self, entry: &RecordEntry, batch: &BatchOverlay) -> JournalResult<()> {
        let state = match entry.tx {
            Some(tx) if tx.0 == 0 => {
                return Err(JournalError::InvalidTransaction { tx, reason: "transaction id 0 is reserved" })
            }
            Some(tx) => match batch.tx_states.get(&tx) {
                Some(staged) => *staged,
                None => self.open.get(&tx).map(|open| open.state),
            },
            None => None,
        };

        match (&entry.body, entry.tx) {
            (RecordBody::Prepare { .. } | RecordBody::Commit | RecordBody::Rollback, None) => {
                Err(JournalError::InvalidTransaction { tx: TxId(0), reason: "marker without a transaction" })
            }
            (RecordBody::Prepare { .. }, Some(tx)) => match state {
                Some(TxState::Prepared) => Err(JournalError::InvalidTransaction { tx, reason: "already prepared" }),
                _ => Ok(()),
            },
            (RecordBody::Commit, Some(tx)) => match state {
                Some(TxState::Prepared) => Ok(()),
                Some(_) => Err(JournalError::InvalidTransaction { tx, reason: "commit requires a prepared transaction" }),
                None => Err(JournalError::InvalidTransaction { tx, reason: "unknown transaction" }),
            },
            (RecordBody::Rollback, Some(tx)) => match state {
                Some(_) => Ok(()),
                None => Err(JournalError::InvalidTransaction { tx, reason: "unknown transaction" }),
            },
            (body, tx) => {
                if let (Some(tx), Some(TxState::Prepared)) = (tx, state) {
                    return Err(JournalError::InvalidTransaction { tx, reason: "already prepared" });
                }
                if let Some(target) = body.target() {
                    let visible = self.live.contains_key(&target)
                        || tx.map_or(false, |tx| self.staged_add(tx, target));
                    if !visible || self.pending_deletes.contains(&target) || batch.consumed.contains(&target) {
                        return Err(JournalError::NotFound(target));
                    }
                }
                Ok(())
            }
        }
    }

    fn staged_add(&self, tx: TxId, target: RecordId) -> bool {
        self.open.get(&tx).map_or(false, |open| {
            open.ops.iter().any(|(op, e)| *op == StagedOp::Add && e.id == target)
        })
    }

    pub fn apply(&mut self, record: &JournalRecord, handle: H) {
        let entry = Entry { id: record.id, handle };
        match (record.tx, &record.body) {
            (Some(tx), RecordBody::Prepare { .. }) => {
                let open = self.open.entry(tx).or_insert_with(OpenTx::new);
                open.state = TxState::Prepared;
                open.prepare = Some(entry);
            }
            (Some(tx), RecordBody::Commit) => match self.open.remove(&tx) {
                Some(open) => {
                    for (op, e) in &open.ops {
                        self.apply_op(*op, e.clone());
                    }
                    self.settle(tx, TxState::Committed, open, entry);
                }
                None => self.orphans += 1,
            },
            (Some(tx), RecordBody::Rollback) => match self.open.remove(&tx) {
                Some(open) => {
                    for (op, _) in &open.ops {
                        if let StagedOp::Delete(target) = op {
                            self.pending_deletes.remove(target);
                        }
                    }
                    self.settle(tx, TxState::RolledBack, open, entry);
                }
                None => self.orphans += 1,
            },
            (tx, body) => match (tx, StagedOp::of(body)) {
                (Some(tx), Some(op)) => {
                    if let StagedOp::Delete(target) = op {
                        self.pending_deletes.insert(target);
                    }
                    self.open.entry(tx).or_insert_with(OpenTx::new).ops.push((op, entry));
                }
                (None, Some(op)) => self.apply_op(op, entry),
                // markers without a transaction never decode
                _ => self.orphans += 1,
            },
        }
    }

    fn settle(&mut self, tx: TxId, outcome: TxState, open: OpenTx<H>, terminal: Entry<H>) {
        let records = open.entries();
        self.settled.insert(terminal.id, SettledTx { tx, outcome, records, terminal });
    }

    fn apply_op(&mut self, op: StagedOp, entry: Entry<H>) {
        match op {
            StagedOp::Add => {
                self.live.insert(entry.id, LiveRecord { add: entry, updates: Vec::new() });
            }
            StagedOp::Update(target) => match self.live.get_mut(&target) {
                Some(live) => live.updates.push(entry),
                None => self.orphans += 1,
            },
            StagedOp::Delete(target) => {
                self.pending_deletes.remove(&target);
                match self.live.remove(&target) {
                    Some(live) => {
                        self.tombstones.insert(target, Tombstone { delete: entry, add: live.add });
                    }
                    None => self.orphans += 1,
                }
            }
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn transaction(&self, tx: TxId) -> Option<TransactionContext> {
        self.open.get(&tx).map(|open| TransactionContext {
            id: tx,
            state: open.state,
            record_ids: open.ops.iter().map(|(_, e)| e.id).collect(),
        })
    }

    pub fn transactions_in(&self, state: TxState) -> Vec<TxId> {
        self.open.iter().filter(|(_, open)| open.state == state).map(|(tx, _)| *tx).collect()
    }

    pub fn in_doubt(&self) -> Vec<RecoveredTransaction> {
        self.open
            .iter()
            .filter(|(_, open)| open.state == TxState::Prepared)
            .map(|(tx, open)| RecoveredTransaction {
                id: *tx,
                prepare_record: open.prepare.as_ref().map(|e| e.id),
                record_ids: open.ops.iter().map(|(_, e)| e.id).collect(),
            })
            .collect()
    }
}

fn relocate_entry(
    entry: &mut Entry<Location>,
    moved: &FxHashMap<RecordId, Moved>,
    removed: &FxHashSet<FileId>,
    need_tx_form: bool,
) -> bool {
    if !removed.contains(&entry.handle.file) {
        return true;
    }
    match moved.get(&entry.id) {
        Some(m) if m.tx_form || !need_tx_form => {
            entry.handle = m.loc;
            true
        }
        _ => false,
    }
}

impl RecordIndex<Location> {
    /// Points every handle into `removed` files at its rewritten copy, and
    /// forgets what no longer exists on disk.
    pub fn relocate(&mut self, moved: &FxHashMap<RecordId, Moved>, removed: &FxHashSet<FileId>) {
        for live in self.live.values_mut() {
            if !relocate_entry(&mut live.add, moved, removed, false) {
                tracing::error!(record = live.add.id.0, "live record missing from compaction output");
            }
            live.updates.retain_mut(|u| relocate_entry(u, moved, removed, false));
        }

        self.tombstones.retain(|_, t| {
            relocate_entry(&mut t.add, moved, removed, false) && relocate_entry(&mut t.delete, moved, removed, false)
        });

        for open in self.open.values_mut() {
            for (_, e) in open.ops.iter_mut() {
                relocate_entry(e, moved, removed, true);
            }
            if let Some(prepare) = open.prepare.as_mut() {
                relocate_entry(prepare, moved, removed, true);
            }
        }

        self.settled.retain(|_, settled| {
            settled.records.retain_mut(|e| relocate_entry(e, moved, removed, true));
            relocate_entry(&mut settled.terminal, moved, removed, true) && !settled.records.is_empty()
        });
    }
}
