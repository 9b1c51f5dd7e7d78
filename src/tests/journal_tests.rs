// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::{JournalConfig, SyncPolicy};
use crate::error::JournalError;
use crate::journal::Journal;
use crate::record::{JournalRecord, RecordBody, RecordEntry};
use crate::types::id::{FileId, RecordId};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

/// 8-byte payloads make every Add and Delete frame 33 bytes long.
pub(crate) const FRAME: u64 = 33;

pub(crate) fn payload(n: u64) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

/// Two frames per file.
pub(crate) fn small_config(dir: &Path) -> JournalConfig {
    JournalConfig {
        dir: dir.to_path_buf(),
        file_size: 24 + 2 * FRAME,
        sync: SyncPolicy::EveryWrite,
        ..Default::default()
    }
}

#[test]
fn test_append_assigns_monotonic_ids() {
    let dir = tempdir().unwrap();
    let (journal, report) = Journal::open(small_config(dir.path())).unwrap();
    assert_eq!(report.records_replayed, 0);
    assert_eq!(journal.last_record_id(), RecordId::NONE);

    for expected in 1..=5u64 {
        let id = journal.append(RecordEntry::add(payload(expected))).unwrap();
        assert_eq!(id, RecordId(expected));
    }
    assert_eq!(journal.last_record_id(), RecordId(5));
    assert_eq!(journal.stats().live_records, 5);
}

#[test]
fn test_mark_deleted_rejects_unknown_and_repeated_ids() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    let id = journal.append(RecordEntry::add(payload(1))).unwrap();

    assert!(matches!(journal.mark_deleted(RecordId(99)), Err(JournalError::NotFound(RecordId(99)))));
    journal.mark_deleted(id).unwrap();
    assert!(matches!(journal.mark_deleted(id), Err(JournalError::NotFound(_))));
    assert!(matches!(
        journal.append(RecordEntry::update(id, payload(2))),
        Err(JournalError::NotFound(_))
    ));

    // rejected records do not consume ids
    assert_eq!(journal.append(RecordEntry::add(payload(3))).unwrap(), RecordId(3));
}

#[test]
fn test_scenario_add_add_delete_survives_restart() {
    let dir = tempdir().unwrap();
    let (first, second) = {
        let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
        let first = journal.append(RecordEntry::add(b"order-1".to_vec())).unwrap();
        let second = journal.append(RecordEntry::add(b"order-2".to_vec())).unwrap();
        journal.mark_deleted(first).unwrap();
        (first, second)
        // dropped without any shutdown step beyond stopping the writer
    };

    let (journal, report) = Journal::open(small_config(dir.path())).unwrap();
    assert_eq!(report.records_replayed, 3);
    assert!(report.replay.tails.is_empty());

    let records: Vec<JournalRecord> = journal.replay().unwrap().collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].body, RecordBody::Delete { target: first });

    let live = journal.replay().unwrap().into_live_set();
    assert_eq!(live.ids(), vec![second]);
    assert_eq!(live.records[&second].payload, b"order-2");
    assert!(!journal.contains(first));
    assert!(journal.contains(second));
}

#[test]
fn test_rotation_never_splits_records() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    for n in 1..=7 {
        journal.append(RecordEntry::add(payload(n))).unwrap();
    }

    let files = journal.files();
    assert_eq!(files.len(), 4);
    for f in &files {
        assert!(f.len <= 24 + 2 * FRAME);
        assert_eq!(f.data_bytes() % FRAME, 0);
    }
    assert_eq!(journal.stats().active_file, FileId(4));
    drop(journal);

    let (journal, report) = Journal::open(small_config(dir.path())).unwrap();
    assert_eq!(report.records_replayed, 7);
    let ids: Vec<u64> = journal.replay().unwrap().map(|r| r.id.0).collect();
    assert_eq!(ids, (1..=7).collect::<Vec<_>>());
    assert_eq!(journal.append(RecordEntry::add(payload(8))).unwrap(), RecordId(8));
}

#[test]
fn test_oversized_record_is_refused() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    let err = journal.append(RecordEntry::add(vec![0u8; 512])).unwrap_err();
    assert!(matches!(err, JournalError::RecordTooLarge { .. }));
    assert_eq!(journal.append(RecordEntry::add(payload(1))).unwrap(), RecordId(1));
}

#[test]
fn test_concurrent_appends_get_unique_contiguous_ids() {
    let dir = tempdir().unwrap();
    let config = JournalConfig {
        dir: dir.path().to_path_buf(),
        file_size: 4096,
        sync: SyncPolicy::Batched { max_delay_ms: 2, max_batch: 64 },
        ..Default::default()
    };
    let (journal, _) = Journal::open(config.clone()).unwrap();
    let journal = Arc::new(journal);

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let journal = Arc::clone(&journal);
            thread::spawn(move || {
                (0..50u64)
                    .map(|i| journal.append(RecordEntry::add(payload(t * 1000 + i))).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).map(|id| id.0).collect();
    ids.sort();
    assert_eq!(ids, (1..=400).collect::<Vec<_>>());

    let replayed: Vec<u64> = journal.replay().unwrap().map(|r| r.id.0).collect();
    assert_eq!(replayed, (1..=400).collect::<Vec<_>>());
    drop(journal);

    let (_, report) = Journal::open(config).unwrap();
    assert_eq!(report.records_replayed, 400);
}

#[test]
fn test_apply_replicated_keeps_ids_and_skips_duplicates() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();

    let add = JournalRecord { id: RecordId(10), tx: None, body: RecordBody::Add { payload: payload(1) } };
    assert!(journal.apply_replicated(add.clone()).unwrap());
    assert!(!journal.apply_replicated(add).unwrap());

    let delete = JournalRecord { id: RecordId(11), tx: None, body: RecordBody::Delete { target: RecordId(10) } };
    assert!(journal.apply_replicated(delete).unwrap());
    assert_eq!(journal.last_record_id(), RecordId(11));
    assert!(journal.replay().unwrap().into_live_set().is_empty());
}

#[test]
fn test_reset_discards_everything() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    for n in 1..=5 {
        journal.append(RecordEntry::add(payload(n))).unwrap();
    }
    journal.reset().unwrap();

    assert_eq!(journal.replay().unwrap().count(), 0);
    assert_eq!(journal.stats().files, 1);
    assert_eq!(journal.append(RecordEntry::add(payload(6))).unwrap(), RecordId(1));
    drop(journal);

    let (_, report) = Journal::open(small_config(dir.path())).unwrap();
    assert_eq!(report.records_replayed, 1);
}

#[test]
fn test_record_tap_sees_appends_in_id_order() {
    use std::sync::Mutex;

    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        journal.set_record_tap(Some(Arc::new(move |record: &JournalRecord| seen.lock().unwrap().push(record.id))));
    }

    let first = journal.append(RecordEntry::add(payload(1))).unwrap();
    journal.mark_deleted(first).unwrap();
    let replicated = JournalRecord { id: RecordId(9), tx: None, body: RecordBody::Add { payload: payload(9) } };
    journal.apply_replicated(replicated).unwrap();
    journal.set_record_tap(None);
    journal.append(RecordEntry::add(payload(2))).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![RecordId(1), RecordId(2)]);
}

#[test]
fn test_failed_sync_leaves_index_untouched() {
    let dir = tempdir().unwrap();
    let (journal, _) = Journal::open(small_config(dir.path())).unwrap();
    let kept = journal.append(RecordEntry::add(payload(1))).unwrap();

    journal.fail_next_sync();
    let err = journal.append(RecordEntry::add(payload(2))).unwrap_err();
    assert!(matches!(err, JournalError::Io(_)));

    assert!(journal.is_failed());
    assert!(journal.contains(kept));
    assert!(!journal.contains(RecordId(2)));
    assert_eq!(journal.last_record_id(), kept);
    assert_eq!(journal.stats().live_records, 1);
    assert!(matches!(journal.append(RecordEntry::add(payload(3))), Err(JournalError::Failed)));
}

#[test]
fn test_one_batch_cannot_delete_a_record_twice() {
    let dir = tempdir().unwrap();
    let config = JournalConfig {
        dir: dir.path().to_path_buf(),
        file_size: 4096,
        sync: SyncPolicy::Batched { max_delay_ms: 50, max_batch: 64 },
        ..Default::default()
    };
    let (journal, _) = Journal::open(config).unwrap();
    let target = journal.append(RecordEntry::add(payload(1))).unwrap();
    let journal = Arc::new(journal);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let journal = Arc::clone(&journal);
            thread::spawn(move || journal.mark_deleted(target).is_ok())
        })
        .collect();
    let deleted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

    assert_eq!(deleted, 1);
    assert!(!journal.contains(target));
    assert_eq!(journal.stats().tombstones, 1);
}
