// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Compaction: rewrite the retained records of sparse files into one new
//! file and retire the originals.
//!
//! A record is retained when replay would still need it:
//! - live Adds and their Updates,
//! - a Delete while the Add it cancels is still on disk somewhere,
//! - every record of a transaction that is still open,
//! - the Commit or Rollback of a settled transaction while any of its
//!   transactional records remain on disk outside the rewritten set.
//!
//! Live and tombstone records of committed transactions are rewritten without
//! their transaction id, which is what eventually lets the terminal go.

use super::file::{self, FileHeader, JournalFile};
use super::state::{Location, Moved, RecordIndex};
use super::Shared;
use crate::config::CompactionPolicy;
use crate::error::{JournalError, JournalResult};
use crate::record::{decode_frame, encode_into};
use crate::types::enums::{FileKind, FileState};
use crate::types::id::{FileId, RecordId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Files retired by this pass, rewritten or simply dead.
    pub reclaimed: Vec<FileId>,
    pub output: Option<FileId>,
    pub records_carried: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

enum Need {
    Always,
    /// Tombstone: only while the Add's file survives.
    WhileFileSurvives(FileId),
    /// Terminal record: only while one of these files survives.
    WhileAnySurvives(Vec<FileId>),
}

struct Retained {
    id: RecordId,
    loc: Location,
    strip_tx: bool,
    need: Need,
}

#[derive(Debug)]
pub(crate) struct Carry {
    pub id: RecordId,
    pub loc: Location,
    pub strip_tx: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub candidates: BTreeSet<FileId>,
    pub carry: Vec<Carry>,
}

fn retained(index: &RecordIndex<Location>) -> Vec<Retained> {
    let mut out = Vec::new();
    for live in index.live.values() {
        out.push(Retained { id: live.add.id, loc: live.add.handle, strip_tx: true, need: Need::Always });
        for u in &live.updates {
            out.push(Retained { id: u.id, loc: u.handle, strip_tx: true, need: Need::Always });
        }
    }
    for t in index.tombstones.values() {
        out.push(Retained {
            id: t.delete.id,
            loc: t.delete.handle,
            strip_tx: true,
            need: Need::WhileFileSurvives(t.add.handle.file),
        });
    }
    for open in index.open.values() {
        for (_, e) in &open.ops {
            out.push(Retained { id: e.id, loc: e.handle, strip_tx: false, need: Need::Always });
        }
        if let Some(p) = &open.prepare {
            out.push(Retained { id: p.id, loc: p.handle, strip_tx: false, need: Need::Always });
        }
    }
    for settled in index.settled.values() {
        out.push(Retained {
            id: settled.terminal.id,
            loc: settled.terminal.handle,
            strip_tx: false,
            need: Need::WhileAnySurvives(settled.records.iter().map(|e| e.handle.file).collect()),
        });
    }
    out
}

/// Picks sealed files whose retained share is below the policy threshold.
pub(crate) fn plan(
    index: &RecordIndex<Location>,
    files: &BTreeMap<FileId, JournalFile>,
    policy: &CompactionPolicy,
) -> Plan {
    let retained = retained(index);
    let mut live_bytes: FxHashMap<FileId, u64> = FxHashMap::default();
    for r in &retained {
        *live_bytes.entry(r.loc.file).or_default() += r.loc.len as u64;
    }

    let candidates: BTreeSet<FileId> = files
        .values()
        .filter(|f| f.state == FileState::Full)
        .filter(|f| {
            let data = f.data_bytes();
            let live = live_bytes.get(&f.id).copied().unwrap_or(0);
            data == 0 || (live as f64) < policy.min_live_ratio * data as f64
        })
        .map(|f| f.id)
        .collect();

    if candidates.is_empty() || candidates.len() < policy.min_files {
        return Plan::default();
    }
    plan_for(retained, candidates)
}

/// Plan that retires every given file, used to quarantine a damaged set.
pub(crate) fn plan_all(index: &RecordIndex<Location>, files: impl IntoIterator<Item = FileId>) -> Plan {
    plan_for(retained(index), files.into_iter().collect())
}

fn plan_for(retained: Vec<Retained>, candidates: BTreeSet<FileId>) -> Plan {
    let survives = |f: &FileId| !candidates.contains(f);
    let mut carry: Vec<Carry> = retained
        .into_iter()
        .filter(|r| candidates.contains(&r.loc.file))
        .filter(|r| match &r.need {
            Need::Always => true,
            Need::WhileFileSurvives(f) => survives(f),
            Need::WhileAnySurvives(fs) => fs.iter().any(survives),
        })
        .map(|r| Carry { id: r.id, loc: r.loc, strip_tx: r.strip_tx })
        .collect();
    carry.sort_by_key(|c| c.id);
    Plan { candidates, carry }
}

/// Writes the carried records into `output_id`. Returns the new file, if any
/// record was carried, and where each record moved.
pub(crate) fn write_compacted(
    dir: &Path,
    sources: &[JournalFile],
    plan: &Plan,
    output_id: FileId,
) -> JournalResult<(Option<JournalFile>, FxHashMap<RecordId, Moved>)> {
    let mut moved = FxHashMap::default();
    let Some(first) = plan.carry.first() else {
        return Ok((None, moved));
    };

    let header = FileHeader {
        kind: FileKind::Compacted,
        file_id: output_id,
        base_record_id: first.id,
        sources: plan.candidates.iter().copied().collect(),
    };
    let mut out = header.to_bytes();

    let mut contents: FxHashMap<FileId, Vec<u8>> = FxHashMap::default();
    for source in sources.iter().filter(|s| plan.candidates.contains(&s.id)) {
        let mut bytes = fs::read(&source.path)?;
        bytes.truncate(source.len as usize);
        contents.insert(source.id, bytes);
    }

    for carry in &plan.carry {
        let start = carry.loc.offset as usize;
        let end = start + carry.loc.len as usize;
        let frame = contents
            .get(&carry.loc.file)
            .and_then(|bytes| bytes.get(start..end))
            .ok_or_else(|| JournalError::InvalidFile {
                path: file::file_path(dir, carry.loc.file),
                reason: format!("record {} outside durable length", carry.id.0),
            })?;
        let (mut record, _) = decode_frame(frame, carry.loc.offset)?;

        let offset = out.len() as u64;
        let len = if carry.strip_tx && record.tx.is_some() {
            record.tx = None;
            encode_into(&record, &mut out)?
        } else {
            out.extend_from_slice(frame);
            frame.len()
        };
        moved.insert(
            record.id,
            Moved {
                loc: Location { file: output_id, offset, len: len as u32 },
                tx_form: record.tx.is_some(),
            },
        );
    }

    let tmp = file::tmp_path(dir, output_id);
    let path = file::file_path(dir, output_id);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&out)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    file::sync_dir(dir)?;

    let meta = JournalFile::from_header(header, path, out.len() as u64, FileState::Full);
    Ok((Some(meta), moved))
}

/// One compaction pass. The caller holds the compaction lock.
pub(crate) fn run(shared: &Shared) -> JournalResult<CompactionReport> {
    let _gate = shared.write_gate()?;

    let (plan, sources, output_id) = {
        let mut inner = shared.lock_inner()?;
        let plan = plan(&inner.index, &inner.files, &shared.config.compaction);
        if plan.candidates.is_empty() {
            return Ok(CompactionReport::default());
        }
        let mut sources = Vec::with_capacity(plan.candidates.len());
        for id in &plan.candidates {
            if let Some(meta) = inner.files.get_mut(id) {
                meta.state = FileState::Compactable;
                sources.push(meta.clone());
            }
        }
        let output_id = inner.next_file_id;
        inner.next_file_id = output_id.next();
        (plan, sources, output_id)
    };

    let written = write_compacted(&shared.config.dir, &sources, &plan, output_id);
    let (output, moved) = match written {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(error = %e, "journal compaction failed, keeping original files");
            let _ = fs::remove_file(file::tmp_path(&shared.config.dir, output_id));
            let mut inner = shared.lock_inner()?;
            for id in &plan.candidates {
                if let Some(meta) = inner.files.get_mut(id) {
                    meta.state = FileState::Full;
                }
            }
            return Err(e);
        }
    };

    let removed: FxHashSet<FileId> = plan.candidates.iter().copied().collect();
    let report = CompactionReport {
        reclaimed: plan.candidates.iter().copied().collect(),
        output: output.as_ref().map(|f| f.id),
        records_carried: plan.carry.len(),
        bytes_before: sources.iter().map(|s| s.len).sum(),
        bytes_after: output.as_ref().map_or(0, |f| f.len),
    };
    {
        let mut inner = shared.lock_inner()?;
        inner.index.relocate(&moved, &removed);
        for id in &removed {
            inner.files.remove(id);
        }
        if let Some(meta) = output {
            inner.files.insert(meta.id, meta);
        }
    }

    for source in &sources {
        if let Err(e) = fs::remove_file(&source.path) {
            tracing::warn!(file = source.id.0, error = %e, "failed to remove compacted journal file");
        }
    }
    file::sync_dir(&shared.config.dir)?;

    tracing::info!(
        reclaimed = report.reclaimed.len(),
        carried = report.records_carried,
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
        "journal compaction finished"
    );
    Ok(report)
}
