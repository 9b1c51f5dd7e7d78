// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Journal storage engine.
//!
//! A journal is a directory of fixed-size append files plus the compacted
//! files that replace sparse ones. Appends, deletes and replicated records
//! all funnel through one writer thread, so record id order is durable write
//! order. Compaction runs beside the writer and only ever touches sealed
//! files; it excludes replay through the replay gate.

pub mod compaction;
pub mod file;
pub mod replay;
pub mod state;
mod recovery;
mod writer;

pub use compaction::CompactionReport;
pub use file::JournalFile;
pub use recovery::RecoveryReport;
pub use replay::{LiveEntry, LiveSet, Replay, ReplaySummary, UnreplayableTail};
pub use state::Location;

use crate::config::{InDoubtPolicy, JournalConfig};
use crate::error::{JournalError, JournalResult};
use crate::record::{JournalRecord, RecordEntry};
use crate::txn::{RecoveredTransaction, Resolution, TransactionContext};
use crate::types::enums::TxState;
use crate::types::id::{FileId, RecordId, TxId};
use replay::{MergedReplay, SourceFile};
use state::RecordIndex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use writer::Request;

pub(crate) struct Inner {
    pub(crate) files: BTreeMap<FileId, JournalFile>,
    pub(crate) index: RecordIndex<Location>,
    pub(crate) next_id: RecordId,
    pub(crate) next_file_id: FileId,
    pub(crate) active: FileId,
}

/// Observer of every record appended through this journal, called on the
/// writer thread in record id order once the record is durable and before
/// its caller is answered. Replicated records are not reported.
pub type RecordTap = Arc<dyn Fn(&JournalRecord) + Send + Sync>;

pub(crate) struct Shared {
    pub(crate) config: JournalConfig,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) replay_gate: RwLock<()>,
    pub(crate) compaction: Mutex<()>,
    pub(crate) failed: AtomicBool,
    pub(crate) tap: Mutex<Option<RecordTap>>,
    #[cfg(test)]
    pub(crate) fail_next_sync: AtomicBool,
}

impl Shared {
    pub(crate) fn lock_inner(&self) -> JournalResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| JournalError::Failed)
    }

    pub(crate) fn read_gate(&self) -> JournalResult<RwLockReadGuard<'_, ()>> {
        self.replay_gate.read().map_err(|_| JournalError::Failed)
    }

    pub(crate) fn write_gate(&self) -> JournalResult<RwLockWriteGuard<'_, ()>> {
        self.replay_gate.write().map_err(|_| JournalError::Failed)
    }

    pub(crate) fn record_tap(&self) -> Option<RecordTap> {
        self.tap.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub next_record_id: RecordId,
    pub live_records: usize,
    pub tombstones: usize,
    pub open_transactions: usize,
    pub settled_transactions: usize,
    pub orphans: u64,
    pub files: usize,
    pub active_file: FileId,
    pub bytes: u64,
}

pub struct Journal {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    writer: Option<JoinHandle<()>>,
}

impl Journal {
    /// Opens (or creates) the journal in `config.dir`, replays it, repairs a
    /// torn tail and settles transactions left open by a crash.
    pub fn open(config: JournalConfig) -> JournalResult<(Self, RecoveryReport)> {
        let recovered = recovery::recover(&config)?;
        let mut report = recovered.report;

        let shared = Arc::new(Shared {
            config,
            inner: Mutex::new(recovered.inner),
            replay_gate: RwLock::new(()),
            compaction: Mutex::new(()),
            failed: AtomicBool::new(false),
            tap: Mutex::new(None),
            #[cfg(test)]
            fail_next_sync: AtomicBool::new(false),
        });
        let (requests, receiver) = mpsc::channel();
        let writer = writer::spawn(Arc::clone(&shared), recovered.active, receiver)?;
        let journal = Journal { shared, requests, writer: Some(writer) };

        journal.resolve_open_transactions(&mut report)?;
        Ok((journal, report))
    }

    fn resolve_open_transactions(&self, report: &mut RecoveryReport) -> JournalResult<()> {
        let (incomplete, in_doubt) = {
            let inner = self.shared.lock_inner()?;
            (inner.index.transactions_in(TxState::Active), inner.index.in_doubt())
        };

        for tx in incomplete {
            self.rollback(tx)?;
            tracing::warn!(tx = tx.0, "rolled back transaction left incomplete by a crash");
            report.transactions.push((tx, Resolution::RolledBackIncomplete));
        }

        for recovered in in_doubt {
            let resolution = match self.shared.config.in_doubt {
                InDoubtPolicy::Hold => {
                    report.in_doubt.push(recovered.clone());
                    Resolution::Held
                }
                InDoubtPolicy::Commit => {
                    self.commit(recovered.id)?;
                    Resolution::Committed
                }
                InDoubtPolicy::Rollback => {
                    self.rollback(recovered.id)?;
                    Resolution::RolledBack
                }
            };
            tracing::info!(tx = recovered.id.0, ?resolution, "in-doubt transaction recovered");
            report.transactions.push((recovered.id, resolution));
        }
        Ok(())
    }

    fn submit<T>(&self, request: impl FnOnce(SyncSender<JournalResult<T>>) -> Request) -> JournalResult<T> {
        let (reply, response) = mpsc::sync_channel(1);
        self.requests.send(request(reply)).map_err(|_| JournalError::Closed)?;
        response.recv().map_err(|_| JournalError::Closed)?
    }

    /// Appends a record and returns its id once it is durable.
    pub fn append(&self, entry: RecordEntry) -> JournalResult<RecordId> {
        self.append_record(entry).map(|record| record.id)
    }

    /// Like [`append`](Self::append) but hands back the stored record, which
    /// is what replication forwards.
    pub fn append_record(&self, entry: RecordEntry) -> JournalResult<JournalRecord> {
        self.submit(|reply| Request::Append { entry, reply })
    }

    /// Appends a Delete for `id`. Fails with `NotFound` if `id` is not live.
    pub fn mark_deleted(&self, id: RecordId) -> JournalResult<RecordId> {
        self.append(RecordEntry::delete(id))
    }

    pub fn prepare(&self, tx: TxId, payload: impl Into<Vec<u8>>) -> JournalResult<RecordId> {
        self.append(RecordEntry::prepare(tx, payload))
    }

    pub fn commit(&self, tx: TxId) -> JournalResult<RecordId> {
        self.append(RecordEntry::commit(tx))
    }

    pub fn rollback(&self, tx: TxId) -> JournalResult<RecordId> {
        self.append(RecordEntry::rollback(tx))
    }

    /// Applies a record received from the live node, keeping its id.
    /// Returns `false` when the record was already applied.
    pub fn apply_replicated(&self, record: JournalRecord) -> JournalResult<bool> {
        self.submit(|reply| Request::Replicated { record, reply })
    }

    /// Discards all journal content. A backup calls this before a full
    /// resynchronisation from its live node.
    pub fn reset(&self) -> JournalResult<()> {
        self.submit(|reply| Request::Reset { reply })
    }

    /// Lazily replays the durable contents of the journal. Each call starts a
    /// fresh pass over the same files.
    pub fn replay(&self) -> JournalResult<Replay<'_>> {
        let gate = self.shared.read_gate()?;
        let sources: Vec<SourceFile> = {
            let inner = self.shared.lock_inner()?;
            inner.files.values().map(SourceFile::from).collect()
        };
        Ok(Replay { _gate: gate, inner: MergedReplay::open(&sources)? })
    }

    /// Rewrites sparse sealed files. Blocks while another compaction or a
    /// replay is running.
    pub fn compact(&self) -> JournalResult<CompactionReport> {
        let _running = self.shared.compaction.lock().map_err(|_| JournalError::Failed)?;
        compaction::run(&self.shared)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.shared.lock_inner().map(|inner| inner.index.contains(id)).unwrap_or(false)
    }

    /// Id of the most recently assigned record, `RecordId::NONE` if empty.
    pub fn last_record_id(&self) -> RecordId {
        self.shared
            .lock_inner()
            .map(|inner| RecordId(inner.next_id.0.saturating_sub(1)))
            .unwrap_or(RecordId::NONE)
    }

    pub fn transaction(&self, tx: TxId) -> Option<TransactionContext> {
        self.shared.lock_inner().ok()?.index.transaction(tx)
    }

    pub fn in_doubt_transactions(&self) -> Vec<RecoveredTransaction> {
        self.shared.lock_inner().map(|inner| inner.index.in_doubt()).unwrap_or_default()
    }

    pub fn files(&self) -> Vec<JournalFile> {
        self.shared
            .lock_inner()
            .map(|inner| inner.files.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> JournalStats {
        let Ok(inner) = self.shared.lock_inner() else {
            return JournalStats::default();
        };
        JournalStats {
            next_record_id: inner.next_id,
            live_records: inner.index.live.len(),
            tombstones: inner.index.tombstones.len(),
            open_transactions: inner.index.open.len(),
            settled_transactions: inner.index.settled.len(),
            orphans: inner.index.orphans,
            files: inner.files.len(),
            active_file: inner.active,
            bytes: inner.files.values().map(|f| f.len).sum(),
        }
    }

    /// Installs or removes the observer of appended records.
    pub fn set_record_tap(&self, tap: Option<RecordTap>) {
        *self.shared.tap.lock().unwrap_or_else(PoisonError::into_inner) = tap;
    }

    /// True once a write or sync failed; every later append is refused.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &JournalConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.shared.fail_next_sync.store(true, Ordering::Release);
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
