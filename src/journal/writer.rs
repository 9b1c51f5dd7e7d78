// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The journal's single ordering point.
//!
//! Callers enqueue requests on a FIFO channel; one thread validates them,
//! assigns record ids, encodes the frames and writes them. With a batched
//! sync policy it gathers requests for a bounded delay and covers the whole
//! batch with one `fsync` (group commit). Replies go out only after the sync.

use super::file::{self, JournalFile, FILE_HEADER_SIZE};
use super::state::{BatchOverlay, Location};
use super::{compaction, Inner, Shared};
use crate::error::{JournalError, JournalResult};
use crate::record::{checked_len, encode_into, JournalRecord, RecordEntry};
use crate::types::enums::FileState;
use crate::types::id::{FileId, RecordId};
use std::fs::{self, File};
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub(crate) type Reply<T> = SyncSender<JournalResult<T>>;

pub(crate) enum Request {
    Append { entry: RecordEntry, reply: Reply<JournalRecord> },
    /// A record received from the live node; keeps its id.
    Replicated { record: JournalRecord, reply: Reply<bool> },
    Reset { reply: Reply<()> },
    Shutdown,
}

/// The file currently receiving appends. Owned by the writer thread.
pub(crate) struct ActiveFile {
    pub id: FileId,
    pub file: File,
    pub written: u64,
    pub data_start: u64,
}

impl ActiveFile {
    pub(crate) fn new(file: File, meta: &JournalFile) -> Self {
        Self { id: meta.id, file, written: meta.len, data_start: meta.data_start }
    }
}

enum Pending {
    Record(Reply<JournalRecord>, JournalRecord, Location),
    Replicated(Reply<bool>, JournalRecord, Location),
}

impl Pending {
    fn staged(&self) -> (&JournalRecord, Location) {
        match self {
            Pending::Record(_, record, loc) | Pending::Replicated(_, record, loc) => (record, *loc),
        }
    }

    fn fail(self, err: JournalError) {
        match self {
            Pending::Record(reply, ..) => {
                let _ = reply.send(Err(err));
            }
            Pending::Replicated(reply, ..) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn complete(self) {
        match self {
            Pending::Record(reply, record, _) => {
                let _ = reply.send(Ok(record));
            }
            Pending::Replicated(reply, ..) => {
                let _ = reply.send(Ok(true));
            }
        }
    }
}

fn reject(request: Request, err: JournalError) {
    match request {
        Request::Append { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Request::Replicated { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Request::Reset { reply } => {
            let _ = reply.send(Err(err));
        }
        Request::Shutdown => {}
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    active: ActiveFile,
    requests: Receiver<Request>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("journal-writer".into())
        .spawn(move || Writer { shared, active, requests, rotated: false }.run())
}

struct Writer {
    shared: Arc<Shared>,
    active: ActiveFile,
    requests: Receiver<Request>,
    rotated: bool,
}

impl Writer {
    fn run(mut self) {
        let policy = self.shared.config.sync;
        loop {
            let first = match self.requests.recv() {
                Ok(Request::Shutdown) | Err(_) => break,
                Ok(Request::Reset { reply }) => {
                    let _ = reply.send(self.reset());
                    continue;
                }
                Ok(request) => request,
            };

            let mut batch = vec![first];
            let mut deferred = None;
            let deadline = Instant::now() + policy.max_delay();
            while batch.len() < policy.max_batch() {
                let now = Instant::now();
                let next = if now >= deadline {
                    match self.requests.try_recv() {
                        Ok(r) => r,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match self.requests.recv_timeout(deadline - now) {
                        Ok(r) => r,
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                };
                match next {
                    Request::Shutdown | Request::Reset { .. } => {
                        deferred = Some(next);
                        break;
                    }
                    request => batch.push(request),
                }
            }

            self.process(batch);

            match deferred {
                Some(Request::Shutdown) => break,
                Some(Request::Reset { reply }) => {
                    let _ = reply.send(self.reset());
                }
                _ => {}
            }
        }
        tracing::debug!(file = self.active.id.0, "journal writer stopped");
    }

    /// Writes one batch. The index and `next_id` only change once the whole
    /// batch is durable; the inner lock is held until then so compaction never
    /// sees a sealed file whose records the index does not know yet.
    fn process(&mut self, batch: Vec<Request>) {
        if self.shared.failed.load(Ordering::Acquire) {
            for request in batch {
                reject(request, JournalError::Failed);
            }
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut inner = match shared.lock_inner() {
            Ok(inner) => inner,
            Err(_) => {
                for request in batch {
                    reject(request, JournalError::Failed);
                }
                return;
            }
        };

        let mut buf = Vec::new();
        let mut pending = Vec::with_capacity(batch.len());
        let mut overlay = BatchOverlay::default();
        let mut next_id = inner.next_id;
        let mut fatal: Option<io::Error> = None;

        for request in batch {
            if fatal.is_some() {
                reject(request, JournalError::Failed);
                continue;
            }
            match request {
                Request::Append { entry, reply } => {
                    if let Err(e) = inner.index.validate_in_batch(&entry, &overlay) {
                        let _ = reply.send(Err(e));
                        continue;
                    }
                    let record = entry.into_record(next_id);
                    match self.place(&mut inner, &mut buf, &record) {
                        Ok(loc) => {
                            overlay.note(&record);
                            next_id = record.id.next();
                            pending.push(Pending::Record(reply, record, loc));
                        }
                        Err(JournalError::Io(e)) => {
                            let _ = reply.send(Err(JournalError::io_like(&e)));
                            fatal = Some(e);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Request::Replicated { record, reply } => {
                    if record.id < next_id {
                        let _ = reply.send(Ok(false));
                        continue;
                    }
                    match self.place(&mut inner, &mut buf, &record) {
                        Ok(loc) => {
                            next_id = record.id.next();
                            pending.push(Pending::Replicated(reply, record, loc));
                        }
                        Err(JournalError::Io(e)) => {
                            let _ = reply.send(Err(JournalError::io_like(&e)));
                            fatal = Some(e);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                other => reject(other, JournalError::Closed),
            }
        }

        if fatal.is_none() {
            if let Err(e) = self.flush(&mut buf) {
                fatal = Some(e);
            }
        }

        if let Some(e) = fatal {
            drop(inner);
            self.shared.failed.store(true, Ordering::Release);
            tracing::error!(error = %e, file = self.active.id.0, "journal write failed, refusing further appends");
            for p in pending {
                p.fail(JournalError::io_like(&e));
            }
            return;
        }

        if let Some(meta) = inner.files.get_mut(&self.active.id) {
            meta.len = self.active.written;
        }
        for p in &pending {
            let (record, loc) = p.staged();
            inner.index.apply(record, loc);
        }
        inner.next_id = next_id;
        drop(inner);

        let tap = self.shared.record_tap();
        for p in pending {
            if let (Some(tap), Pending::Record(_, record, _)) = (&tap, &p) {
                tap(record);
            }
            p.complete();
        }

        if std::mem::take(&mut self.rotated) && self.shared.config.compaction.auto {
            spawn_auto_compaction(&self.shared);
        }
    }

    /// Reserves room for `record` in the active file, rotating first when it
    /// would not fit. Returns where the frame will land.
    fn place(
        &mut self,
        inner: &mut Inner,
        buf: &mut Vec<u8>,
        record: &JournalRecord,
    ) -> JournalResult<Location> {
        let size = checked_len(record)?;
        let limit = self.shared.config.file_size;
        if size as u64 > limit.saturating_sub(FILE_HEADER_SIZE as u64) {
            return Err(JournalError::RecordTooLarge { size, limit });
        }

        let end = self.active.written + buf.len() as u64;
        if end + size as u64 > limit && end > self.active.data_start {
            self.rotate(inner, buf, record.id)?;
        }

        let offset = self.active.written + buf.len() as u64;
        encode_into(record, buf)?;
        Ok(Location { file: self.active.id, offset, len: size as u32 })
    }

    fn flush(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.active.file.write_all(buf)?;
        #[cfg(test)]
        if self.shared.fail_next_sync.swap(false, Ordering::AcqRel) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        self.active.file.sync_data()?;
        self.active.written += buf.len() as u64;
        buf.clear();
        Ok(())
    }

    fn rotate(&mut self, inner: &mut Inner, buf: &mut Vec<u8>, base: RecordId) -> JournalResult<()> {
        self.flush(buf)?;
        if let Some(meta) = inner.files.get_mut(&self.active.id) {
            meta.len = self.active.written;
            meta.state = FileState::Full;
        }

        let id = inner.next_file_id;
        inner.next_file_id = id.next();
        let (handle, meta) = file::create_append(&self.shared.config.dir, id, base)?;
        self.active = ActiveFile::new(handle, &meta);
        inner.files.insert(id, meta);
        inner.active = id;
        self.rotated = true;
        tracing::info!(file = id.0, base = base.0, "rotated journal file");
        Ok(())
    }

    /// Drops every file and starts over from record 1. Used by a backup
    /// before a full resynchronisation.
    fn reset(&mut self) -> JournalResult<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(JournalError::Failed);
        }
        let _gate = self.shared.write_gate()?;
        let mut inner = self.shared.lock_inner()?;

        for meta in inner.files.values() {
            match fs::remove_file(&meta.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        inner.files.clear();
        inner.index = Default::default();
        inner.next_id = RecordId::FIRST;

        let id = inner.next_file_id;
        inner.next_file_id = id.next();
        let (handle, meta) = file::create_append(&self.shared.config.dir, id, RecordId::FIRST)?;
        self.active = ActiveFile::new(handle, &meta);
        inner.files.insert(id, meta);
        inner.active = id;
        tracing::info!(file = id.0, "journal reset");
        Ok(())
    }
}

fn spawn_auto_compaction(shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    let spawned = thread::Builder::new().name("journal-compactor".into()).spawn(move || {
        let Ok(_running) = shared.compaction.try_lock() else {
            return;
        };
        if let Err(e) = compaction::run(&shared) {
            tracing::warn!(error = %e, "background compaction failed");
        }
    });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "could not start background compaction");
    }
}
