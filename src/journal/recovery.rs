// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Open-time recovery of a journal directory.

use super::compaction;
use super::file::{self, JournalFile, FILE_HEADER_SIZE};
use super::replay::{MergedReplay, ReplaySummary, SourceFile};
use super::state::RecordIndex;
use super::writer::ActiveFile;
use super::Inner;
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::txn::{RecoveredTransaction, Resolution};
use crate::types::enums::{FileKind, FileState};
use crate::types::id::{FileId, RecordId, TxId};
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};

/// What opening the journal found and did.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub records_replayed: u64,
    pub live_records: usize,
    pub next_record_id: RecordId,
    pub orphans: u64,
    pub replay: ReplaySummary,
    /// Torn tail cut off the newest append file: file and new length.
    pub truncated: Option<(FileId, u64)>,
    /// Files renamed to `*.corrupt`.
    pub quarantined: Vec<FileId>,
    /// Files a finished compaction had already replaced.
    pub removed_superseded: Vec<FileId>,
    pub removed_leftovers: usize,
    pub transactions: Vec<(TxId, Resolution)>,
    /// Prepared transactions left undecided for the broker.
    pub in_doubt: Vec<RecoveredTransaction>,
}

pub(crate) struct Recovered {
    pub inner: Inner,
    pub active: ActiveFile,
    pub report: RecoveryReport,
}

pub(crate) fn recover(config: &JournalConfig) -> JournalResult<Recovered> {
    let dir = config.dir.as_path();
    fs::create_dir_all(dir)?;
    let scan = file::scan(dir)?;
    let mut report = RecoveryReport::default();

    for leftover in &scan.leftovers {
        fs::remove_file(leftover)?;
        tracing::warn!(path = %leftover.display(), "removed unfinished compaction output");
        report.removed_leftovers += 1;
    }

    // 1. Headers
    let newest = scan.journals.last().map(|(id, _)| *id);
    let mut files: BTreeMap<FileId, JournalFile> = BTreeMap::new();
    for (id, path) in &scan.journals {
        match file::read_header(path) {
            Ok((header, len)) if header.file_id == *id => {
                files.insert(*id, JournalFile::from_header(header, path.clone(), len, FileState::Full));
            }
            Ok(_) | Err(JournalError::InvalidFile { .. }) => {
                let len = fs::metadata(path)?.len();
                if Some(*id) == newest && len < FILE_HEADER_SIZE as u64 {
                    fs::remove_file(path)?;
                    tracing::warn!(file = id.0, len, "removed journal file torn during creation");
                } else {
                    fs::rename(path, file::corrupt_path(path))?;
                    tracing::error!(file = id.0, "journal file has an invalid header, quarantined");
                    report.quarantined.push(*id);
                }
            }
            Err(e) => return Err(e),
        }
    }

    // 2. Finish compactions that crashed before deleting their inputs
    let superseded: BTreeSet<FileId> = files
        .values()
        .filter(|f| f.kind == FileKind::Compacted)
        .flat_map(|f| f.sources.iter().copied())
        .collect();
    for id in superseded {
        if let Some(meta) = files.remove(&id) {
            fs::remove_file(&meta.path)?;
            tracing::info!(file = id.0, "removed journal file replaced by compaction");
            report.removed_superseded.push(id);
        }
    }

    // 3. Replay
    let sources: Vec<SourceFile> = files.values().map(SourceFile::from).collect();
    let mut merged = MergedReplay::open(&sources)?;
    let mut index = RecordIndex::default();
    while let Some((record, loc)) = merged.next_located() {
        index.apply(&record, loc);
    }
    let summary = merged.finish();

    let mut next_id = summary.max_id_seen.next().max(RecordId::FIRST);
    for f in files.values() {
        next_id = next_id.max(f.base_record_id);
    }
    let mut next_file_id = scan.max_id.next();

    // 4. Damage
    if !summary.tails.is_empty() {
        let newest_append = files.values().filter(|f| f.kind == FileKind::Append).map(|f| f.id).last();
        let torn_tail = summary.tails.len() == 1
            && summary.records_dropped == 0
            && Some(summary.tails[0].file) == newest_append;

        if torn_tail {
            let tail = &summary.tails[0];
            if let Some(meta) = files.get_mut(&tail.file) {
                let f = OpenOptions::new().write(true).open(&meta.path)?;
                f.set_len(tail.offset)?;
                f.sync_all()?;
                meta.len = tail.offset;
            }
            tracing::warn!(file = tail.file.0, offset = tail.offset, bytes = tail.bytes, "truncated torn journal tail");
            report.truncated = Some((tail.file, tail.offset));
        } else {
            tracing::error!(
                tails = summary.tails.len(),
                records_dropped = summary.records_dropped,
                "journal corruption beyond the newest append file, quarantining the file set"
            );
            let all: Vec<FileId> = files.keys().copied().collect();
            let plan = compaction::plan_all(&index, all.iter().copied());
            let output_id = next_file_id;
            next_file_id = next_file_id.next();
            let metas: Vec<JournalFile> = files.values().cloned().collect();
            let (output, moved) = compaction::write_compacted(dir, &metas, &plan, output_id)?;

            for meta in &metas {
                fs::rename(&meta.path, file::corrupt_path(&meta.path))?;
                report.quarantined.push(meta.id);
            }
            file::sync_dir(dir)?;
            files.clear();
            if let Some(out) = output {
                files.insert(out.id, out);
            }
            let removed: FxHashSet<FileId> = all.into_iter().collect();
            index.relocate(&moved, &removed);
        }
    }

    // 5. Fresh append file
    let active_id = next_file_id;
    let (handle, meta) = file::create_append(dir, active_id, next_id)?;
    let active = ActiveFile::new(handle, &meta);
    files.insert(active_id, meta);

    report.records_replayed = summary.records;
    report.live_records = index.live.len();
    report.next_record_id = next_id;
    report.orphans = index.orphans;
    report.replay = summary;

    tracing::info!(
        records = report.records_replayed,
        live = report.live_records,
        files = files.len(),
        next_record = next_id.0,
        "journal recovered"
    );

    let inner = Inner { files, index, next_id, next_file_id: active_id.next(), active: active_id };
    Ok(Recovered { inner, active, report })
}
