// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Lazy replay of a journal file set.
//!
//! Every file yields its records in ascending id order, so a k-way merge on
//! the record id reproduces the durable write order even after compaction
//! moved old records into newer files. Ids seen twice (a compaction output
//! next to a file it replaced) are yielded once.
//!
//! When a file holds a corrupt or torn frame, replay stops at the last record
//! that file could still vouch for: records with a larger id, from any file,
//! are treated as not durable. The skipped region is reported as an
//! [`UnreplayableTail`].

use super::file::JournalFile;
use super::state::{Location, RecordIndex};
use crate::record::{decode_frame, CorruptionError, CorruptionKind, JournalRecord};
use crate::types::enums::TxState;
use crate::types::id::{FileId, RecordId, TxId};
use memmap2::{Mmap, MmapOptions};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::RwLockReadGuard;

/// Bytes of one file that replay could not use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnreplayableTail {
    pub file: FileId,
    pub offset: u64,
    pub bytes: u64,
    pub kind: CorruptionKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: u64,
    pub duplicates: u64,
    /// Intact records skipped because they lie past a corruption cutoff.
    pub records_dropped: u64,
    /// Highest id read from any file, dropped records included.
    pub max_id_seen: RecordId,
    pub tails: Vec<UnreplayableTail>,
}

/// What replay needs to know about a file.
#[derive(Clone, Debug)]
pub struct SourceFile {
    pub id: FileId,
    pub path: PathBuf,
    pub data_start: u64,
    pub len: u64,
    pub base_record_id: RecordId,
}

impl From<&JournalFile> for SourceFile {
    fn from(f: &JournalFile) -> Self {
        Self {
            id: f.id,
            path: f.path.clone(),
            data_start: f.data_start,
            len: f.len,
            base_record_id: f.base_record_id,
        }
    }
}

struct Source {
    file: FileId,
    map: Option<Mmap>,
    pos: usize,
    end: usize,
    base: RecordId,
    last_good: Option<RecordId>,
    done: bool,
}

impl Source {
    fn open(desc: &SourceFile) -> io::Result<Self> {
        let mut source = Source {
            file: desc.id,
            map: None,
            pos: desc.data_start as usize,
            end: desc.data_start as usize,
            base: desc.base_record_id,
            last_good: None,
            done: false,
        };
        let file = File::open(&desc.path)?;
        let len = desc.len.min(file.metadata()?.len());
        if len > desc.data_start {
            // SAFETY: journal files are append-only while mapped; replay holds
            // the read gate, which keeps compaction and reset from unlinking
            // or truncating them, and never reads past the durable length.
            let map = unsafe { MmapOptions::new().len(len as usize).map(&file)? };
            source.end = len as usize;
            source.map = Some(map);
        }
        Ok(source)
    }

    fn next(&mut self) -> Option<Result<(JournalRecord, Location), UnreplayableTail>> {
        if self.done || self.pos >= self.end {
            return None;
        }
        let map = self.map.as_ref()?;
        let offset = self.pos as u64;
        let outcome = decode_frame(&map[self.pos..self.end], offset).and_then(|(record, used)| {
            match self.last_good {
                Some(prev) if record.id <= prev => Err(CorruptionError {
                    offset,
                    kind: CorruptionKind::InvalidRecord,
                }),
                _ => Ok((record, used)),
            }
        });
        match outcome {
            Ok((record, used)) => {
                let loc = Location { file: self.file, offset, len: used as u32 };
                self.pos += used;
                self.last_good = Some(record.id);
                Some(Ok((record, loc)))
            }
            Err(err) => {
                self.done = true;
                Some(Err(UnreplayableTail {
                    file: self.file,
                    offset: err.offset,
                    bytes: (self.end as u64).saturating_sub(err.offset),
                    kind: err.kind,
                }))
            }
        }
    }

    /// Last id this file can vouch for.
    fn cutoff(&self) -> RecordId {
        self.last_good.unwrap_or(RecordId(self.base.0.saturating_sub(1)))
    }
}

/// The merge itself, independent of any journal lock.
pub(crate) struct MergedReplay {
    sources: Vec<Source>,
    heads: Vec<Option<(JournalRecord, Location)>>,
    heap: BinaryHeap<Reverse<(RecordId, usize)>>,
    cutoff: Option<RecordId>,
    last: Option<RecordId>,
    started: bool,
    halted: bool,
    summary: ReplaySummary,
}

impl MergedReplay {
    pub(crate) fn open(files: &[SourceFile]) -> io::Result<Self> {
        let sources = files.iter().map(Source::open).collect::<io::Result<Vec<_>>>()?;
        let heads = sources.iter().map(|_| None).collect();
        Ok(Self {
            sources,
            heads,
            heap: BinaryHeap::new(),
            cutoff: None,
            last: None,
            started: false,
            halted: false,
            summary: ReplaySummary::default(),
        })
    }

    fn refill(&mut self, idx: usize) {
        match self.sources[idx].next() {
            Some(Ok((record, loc))) => {
                self.summary.max_id_seen = self.summary.max_id_seen.max(record.id);
                self.heap.push(Reverse((record.id, idx)));
                self.heads[idx] = Some((record, loc));
            }
            Some(Err(tail)) => {
                let cut = self.sources[idx].cutoff();
                self.cutoff = Some(self.cutoff.map_or(cut, |c| c.min(cut)));
                tracing::warn!(
                    file = tail.file.0,
                    offset = tail.offset,
                    bytes = tail.bytes,
                    kind = ?tail.kind,
                    cutoff = cut.0,
                    "unreplayable journal tail"
                );
                self.summary.tails.push(tail);
            }
            None => {}
        }
    }

    pub(crate) fn next_located(&mut self) -> Option<(JournalRecord, Location)> {
        if !self.started {
            self.started = true;
            for idx in 0..self.sources.len() {
                self.refill(idx);
            }
        }
        loop {
            if self.halted {
                return None;
            }
            let Reverse((id, idx)) = self.heap.pop()?;
            let head = self.heads[idx].take();
            self.refill(idx);
            let (record, loc) = head?;

            if self.cutoff.map_or(false, |cut| id > cut) {
                self.halt();
                return None;
            }
            if self.last == Some(id) {
                self.summary.duplicates += 1;
                continue;
            }
            self.last = Some(id);
            self.summary.records += 1;
            return Some((record, loc));
        }
    }

    /// Counts what the cutoff made unreachable.
    fn halt(&mut self) {
        self.halted = true;
        let mut dropped = 1 + self.heads.iter().filter(|h| h.is_some()).count() as u64;
        for head in self.heads.iter_mut() {
            head.take();
        }
        self.heap.clear();
        for idx in 0..self.sources.len() {
            while let Some(next) = self.sources[idx].next() {
                match next {
                    Ok((record, _)) => {
                        self.summary.max_id_seen = self.summary.max_id_seen.max(record.id);
                        dropped += 1;
                    }
                    Err(tail) => self.summary.tails.push(tail),
                }
            }
        }
        self.summary.records_dropped += dropped;
        tracing::warn!(
            records_dropped = dropped,
            cutoff = self.cutoff.map(|c| c.0),
            "journal replay stopped at corruption cutoff"
        );
    }

    pub(crate) fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    pub(crate) fn finish(mut self) -> ReplaySummary {
        while self.next_located().is_some() {}
        self.summary
    }
}

/// Replay of a live journal. Holds the journal's replay gate so compaction
/// cannot retire files underneath it.
pub struct Replay<'a> {
    pub(crate) _gate: RwLockReadGuard<'a, ()>,
    pub(crate) inner: MergedReplay,
}

impl<'a> Replay<'a> {
    pub fn summary(&self) -> &ReplaySummary {
        self.inner.summary()
    }

    /// Folds the remaining records into the set of live records.
    pub fn into_live_set(mut self) -> LiveSet {
        let mut index: RecordIndex<Vec<u8>> = RecordIndex::default();
        while let Some((record, _)) = self.inner.next_located() {
            index.apply(&record, record.payload().to_vec());
        }
        LiveSet::from_index(&index)
    }
}

impl<'a> Iterator for Replay<'a> {
    type Item = JournalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_located().map(|(record, _)| record)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveEntry {
    pub payload: Vec<u8>,
    pub updates: BTreeMap<RecordId, Vec<u8>>,
}

/// The state a broker rebuilds from replay: live records and the
/// transactions still open at the end of the journal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveSet {
    pub records: BTreeMap<RecordId, LiveEntry>,
    pub prepared: BTreeMap<TxId, BTreeSet<RecordId>>,
    pub active: BTreeMap<TxId, BTreeSet<RecordId>>,
}

impl LiveSet {
    fn from_index(index: &RecordIndex<Vec<u8>>) -> Self {
        let records = index
            .live
            .iter()
            .map(|(id, live)| {
                let updates = live.updates.iter().map(|u| (u.id, u.handle.clone())).collect();
                (*id, LiveEntry { payload: live.add.handle.clone(), updates })
            })
            .collect();

        let mut set = LiveSet { records, ..Default::default() };
        for (tx, open) in &index.open {
            let ids = open.ops.iter().map(|(_, e)| e.id).collect();
            match open.state {
                TxState::Prepared => set.prepared.insert(*tx, ids),
                _ => set.active.insert(*tx, ids),
            };
        }
        set
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.keys().copied().collect()
    }

    /// BLAKE3 digest of the live records and open transactions, used to
    /// compare journals across replays, compactions and replicas.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.records.len() as u64).to_le_bytes());
        for (id, entry) in &self.records {
            hasher.update(&id.0.to_le_bytes());
            hasher.update(&(entry.payload.len() as u64).to_le_bytes());
            hasher.update(&entry.payload);
            hasher.update(&(entry.updates.len() as u64).to_le_bytes());
            for (uid, payload) in &entry.updates {
                hasher.update(&uid.0.to_le_bytes());
                hasher.update(&(payload.len() as u64).to_le_bytes());
                hasher.update(payload);
            }
        }
        for (marker, txs) in [(1u8, &self.prepared), (2u8, &self.active)] {
            for (tx, ids) in txs {
                hasher.update(&[marker]);
                hasher.update(&tx.0.to_le_bytes());
                for id in ids {
                    hasher.update(&id.0.to_le_bytes());
                }
            }
        }
        *hasher.finalize().as_bytes()
    }
}
