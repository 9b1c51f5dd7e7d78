// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Journal and paging configuration.
//!
//! Durations are carried as `*_ms` integers so the structs stay trivially
//! serializable; accessors convert to [`Duration`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_PAGE_SIZE: u64 = 10 * 1024 * 1024;
pub const MESSAGE_JOURNAL_DIR: &str = "messages";

/// How the appender forces durability.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// One `fsync` per record.
    EveryWrite,
    /// Group commit: the writer gathers up to `max_batch` requests or waits at
    /// most `max_delay_ms` after the first one, then syncs once for all.
    Batched { max_delay_ms: u64, max_batch: usize },
}

impl SyncPolicy {
    pub fn max_delay(&self) -> Duration {
        match self {
            SyncPolicy::EveryWrite => Duration::ZERO,
            SyncPolicy::Batched { max_delay_ms, .. } => Duration::from_millis(*max_delay_ms),
        }
    }

    pub fn max_batch(&self) -> usize {
        match self {
            SyncPolicy::EveryWrite => 1,
            SyncPolicy::Batched { max_batch, .. } => (*max_batch).max(1),
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Batched { max_delay_ms: 2, max_batch: 512 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Sealed files whose retained bytes fall below this share of their data
    /// bytes are rewritten.
    pub min_live_ratio: f64,
    /// Minimum number of qualifying files before a compaction pass does work.
    pub min_files: usize,
    /// Run a compaction pass in the background after every file rotation.
    pub auto: bool,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self { min_live_ratio: 0.3, min_files: 1, auto: false }
    }
}

/// What to do at open time with transactions that were prepared but never
/// committed or rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InDoubtPolicy {
    /// Keep them prepared and surface them for manual resolution.
    Hold,
    Commit,
    Rollback,
}

impl Default for InDoubtPolicy {
    fn default() -> Self {
        InDoubtPolicy::Hold
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    pub dir: PathBuf,
    /// Rotation threshold for append files, header included.
    pub file_size: u64,
    pub sync: SyncPolicy,
    pub compaction: CompactionPolicy,
    pub in_doubt: InDoubtPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), ..Default::default() }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/journal"),
            file_size: DEFAULT_FILE_SIZE,
            sync: SyncPolicy::default(),
            compaction: CompactionPolicy::default(),
            in_doubt: InDoubtPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PagingConfig {
    pub dir: PathBuf,
    /// High watermark on resident messages per address.
    pub max_resident_messages: usize,
    /// High watermark on resident body bytes per address.
    pub max_resident_bytes: u64,
    /// Rotation threshold for page files.
    pub page_size: u64,
    /// `fsync` page files after every write.
    pub sync_writes: bool,
    /// Group commit policy of the journal holding resident messages.
    pub message_sync: SyncPolicy,
}

impl PagingConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), ..Default::default() }
    }

    /// Journal of resident messages, kept next to the address directories.
    pub fn message_journal(&self) -> JournalConfig {
        JournalConfig { sync: self.message_sync, ..JournalConfig::new(self.dir.join(MESSAGE_JOURNAL_DIR)) }
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/paging"),
            max_resident_messages: 10_000,
            max_resident_bytes: 64 * 1024 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            sync_writes: false,
            message_sync: SyncPolicy::default(),
        }
    }
}
