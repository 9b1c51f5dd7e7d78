// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Message store of a single address.
//!
//! All messages of an address sit in one queue in sequence order, each either
//! resident or pointing into a page file. Draining the queue front to back is
//! therefore delivery order no matter where the bodies live. Resident bodies
//! are also written to the message journal, so both kinds survive a restart.

use super::page_file::{self, PageWriter, ENTRY_HEADER_SIZE};
use super::resident;
use super::{AddressMode, AddressStats, BodyRef, PagedMessage, StoreOutcome};
use crate::error::{PagingError, PagingResult};
use crate::journal::Journal;
use crate::record::RecordEntry;
use crate::types::id::{PageId, RecordId};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const ADDRESS_FILE: &str = "ADDRESS";
const CURSOR_FILE: &str = "cursor";

#[derive(Clone, Copy, Debug)]
pub(crate) struct Limits {
    pub max_messages: usize,
    pub max_bytes: u64,
    pub page_size: u64,
    pub sync: bool,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    sequence: u64,
    body: BodyRef,
}

struct PageState {
    path: PathBuf,
    /// Paged messages still waiting in the queue.
    live: usize,
}

pub(crate) struct AddressStore {
    pub(crate) name: String,
    dir: PathBuf,
    pub(crate) mode: AddressMode,
    limits: Limits,
    next_sequence: u64,
    queue: VecDeque<StoredMessage>,
    resident_count: usize,
    resident_bytes: u64,
    paged_count: usize,
    pages: BTreeMap<PageId, PageState>,
    writer: Option<PageWriter>,
    next_page: PageId,
    /// Highest paged sequence already consumed.
    cursor: u64,
    dir_ready: bool,
}

impl AddressStore {
    pub(crate) fn new(name: String, dir: PathBuf, limits: Limits) -> Self {
        Self {
            name,
            dir,
            mode: AddressMode::Resident,
            limits,
            next_sequence: 1,
            queue: VecDeque::new(),
            resident_count: 0,
            resident_bytes: 0,
            paged_count: 0,
            pages: BTreeMap::new(),
            writer: None,
            next_page: PageId(1),
            cursor: 0,
            dir_ready: false,
        }
    }

    /// Rebuilds the paged part of an address from its directory. Resident
    /// messages come back from the message journal afterwards.
    pub(crate) fn recover(dir: PathBuf, limits: Limits) -> io::Result<Self> {
        let name = fs::read_to_string(dir.join(ADDRESS_FILE))?;
        let cursor = match fs::read(dir.join(CURSOR_FILE)) {
            Ok(bytes) if bytes.len() == 8 => u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            Ok(_) => 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let mut store = Self::new(name, dir, limits);
        store.cursor = cursor;
        store.dir_ready = true;

        let mut page_ids = Vec::new();
        for entry in fs::read_dir(&store.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(page_file::parse_page_name) {
                page_ids.push(id);
            }
        }
        page_ids.sort();

        let mut max_sequence = cursor;
        for id in page_ids {
            let path = page_file::page_path(&store.dir, id);
            let mut live = 0;
            for e in page_file::scan_entries(&path)? {
                max_sequence = max_sequence.max(e.sequence);
                if e.sequence > cursor {
                    store.queue.push_back(StoredMessage {
                        sequence: e.sequence,
                        body: BodyRef::Paged { page: id, offset: e.offset, length: e.length },
                    });
                    live += 1;
                }
            }
            store.next_page = store.next_page.max(id.next());
            if live == 0 {
                fs::remove_file(&path)?;
            } else {
                store.paged_count += live;
                store.pages.insert(id, PageState { path, live });
            }
        }

        store.queue.make_contiguous().sort_by_key(|m| m.sequence);
        store.next_sequence = max_sequence + 1;
        if store.paged_count > 0 {
            store.mode = AddressMode::Paging;
        }
        Ok(store)
    }

    fn over_watermark(&self, incoming: usize) -> bool {
        self.resident_count >= self.limits.max_messages
            || self.resident_bytes + incoming as u64 > self.limits.max_bytes
    }

    /// Switches new messages to page files. Returns false when paging is
    /// disabled for this address.
    pub(crate) fn enter_paging(&mut self) -> bool {
        match self.mode {
            AddressMode::Resident => {
                tracing::info!(address = %self.name, resident = self.resident_count, "address entering paging mode");
                self.mode = AddressMode::Paging;
                true
            }
            AddressMode::Paging => true,
            AddressMode::MemoryOnly => false,
        }
    }

    /// Queues `body`. A resident body is journaled in `messages` before it is
    /// queued; `on_paged` sees the message if it went to a page file.
    pub(crate) fn store(
        &mut self,
        body: Vec<u8>,
        messages: &Journal,
        on_paged: impl FnOnce(u64, &[u8]),
    ) -> PagingResult<StoreOutcome> {
        if self.mode == AddressMode::Resident && self.over_watermark(body.len()) {
            self.enter_paging();
        }
        let sequence = self.next_sequence;

        if self.mode == AddressMode::Paging {
            let body_ref = self.write_page(sequence, &body).map_err(|e| self.disable_paging(e))?;
            self.queue.push_back(StoredMessage { sequence, body: body_ref });
            self.paged_count += 1;
            self.next_sequence += 1;
            on_paged(sequence, &body);
            return Ok(StoreOutcome { sequence, paged: true, record: None });
        }

        let record = messages.append(RecordEntry::add(resident::encode(&self.name, sequence, &body)))?;
        self.resident_count += 1;
        self.resident_bytes += body.len() as u64;
        self.queue.push_back(StoredMessage { sequence, body: BodyRef::Resident { body, record } });
        self.next_sequence += 1;
        Ok(StoreOutcome { sequence, paged: false, record: Some(record) })
    }

    /// Puts a journaled resident message back in sequence order. Returns
    /// false if the sequence is already queued.
    pub(crate) fn restore_resident(&mut self, sequence: u64, body: Vec<u8>, record: RecordId) -> bool {
        let Err(pos) = self.queue.binary_search_by_key(&sequence, |m| m.sequence) else {
            return false;
        };
        self.resident_count += 1;
        self.resident_bytes += body.len() as u64;
        self.queue.insert(pos, StoredMessage { sequence, body: BodyRef::Resident { body, record } });
        self.next_sequence = self.next_sequence.max(sequence + 1);
        true
    }

    pub(crate) fn front_record(&self) -> Option<RecordId> {
        match self.queue.front()?.body {
            BodyRef::Resident { record, .. } => Some(record),
            BodyRef::Paged { .. } => None,
        }
    }

    /// Drops the resident message journaled as `record`.
    pub(crate) fn forget_resident(&mut self, record: RecordId) -> bool {
        let pos = self
            .queue
            .iter()
            .position(|m| matches!(m.body, BodyRef::Resident { record: r, .. } if r == record));
        match pos {
            Some(pos) => self.take(pos).is_some(),
            None => false,
        }
    }

    fn disable_paging(&mut self, err: io::Error) -> PagingError {
        self.mode = AddressMode::MemoryOnly;
        self.writer = None;
        PagingError::Io(err)
    }

    fn ensure_dir(&mut self) -> io::Result<()> {
        if !self.dir_ready {
            fs::create_dir_all(&self.dir)?;
            fs::write(self.dir.join(ADDRESS_FILE), self.name.as_bytes())?;
            self.dir_ready = true;
        }
        Ok(())
    }

    fn write_page(&mut self, sequence: u64, body: &[u8]) -> io::Result<BodyRef> {
        self.ensure_dir()?;
        let entry = ENTRY_HEADER_SIZE + body.len() as u64;
        let rotate = match &self.writer {
            None => true,
            Some(w) => !w.is_empty() && w.len() + entry > self.limits.page_size,
        };
        if rotate {
            let id = self.next_page;
            self.next_page = id.next();
            let writer = PageWriter::create(&self.dir, id, self.limits.sync)?;
            self.pages.insert(id, PageState { path: writer.path.clone(), live: 0 });
            if let Some(old) = self.writer.replace(writer) {
                self.reclaim_if_drained(old.id);
            }
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no page writer"));
        };
        let length = page_file::entry_length(body.len())?;
        let page = writer.id;
        let offset = writer.append(sequence, body)?;
        if let Some(state) = self.pages.get_mut(&page) {
            state.live += 1;
        }
        Ok(BodyRef::Paged { page, offset, length })
    }

    fn reclaim_if_drained(&mut self, page: PageId) {
        let writing = self.writer.as_ref().map_or(false, |w| w.id == page);
        let drained = self.pages.get(&page).map_or(false, |p| p.live == 0);
        if drained && !writing {
            if let Some(state) = self.pages.remove(&page) {
                if let Err(e) = fs::remove_file(&state.path) {
                    tracing::warn!(address = %self.name, page = page.0, error = %e, "failed to reclaim page file");
                } else {
                    tracing::debug!(address = %self.name, page = page.0, "reclaimed page file");
                }
            }
        }
    }

    fn read_body(&self, message: &StoredMessage) -> PagingResult<Vec<u8>> {
        match &message.body {
            BodyRef::Resident { body, .. } => Ok(body.clone()),
            BodyRef::Paged { page, offset, .. } => {
                let path = self.pages.get(page).map(|p| p.path.clone()).ok_or_else(|| PagingError::Corrupt {
                    address: self.name.clone(),
                    page: *page,
                    offset: *offset,
                })?;
                page_file::read_entry(&path, *offset, message.sequence).map_err(|e| match e.kind() {
                    io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => PagingError::Corrupt {
                        address: self.name.clone(),
                        page: *page,
                        offset: *offset,
                    },
                    _ => PagingError::Io(e),
                })
            }
        }
    }

    /// Removes the message at `pos`, releasing its page slot.
    fn take(&mut self, pos: usize) -> Option<StoredMessage> {
        let message = self.queue.remove(pos)?;
        match &message.body {
            BodyRef::Resident { body, .. } => {
                self.resident_count -= 1;
                self.resident_bytes -= body.len() as u64;
            }
            BodyRef::Paged { page, .. } => {
                let page = *page;
                self.paged_count -= 1;
                if let Some(state) = self.pages.get_mut(&page) {
                    state.live = state.live.saturating_sub(1);
                }
                self.cursor = self.cursor.max(message.sequence);
                if let Err(e) = self.write_cursor() {
                    tracing::warn!(address = %self.name, error = %e, "failed to persist page cursor");
                }
                if self.paged_count == 0 {
                    self.leave_paging();
                }
                self.reclaim_if_drained(page);
            }
        }
        Some(message)
    }

    fn leave_paging(&mut self) {
        if self.mode == AddressMode::Paging {
            tracing::info!(address = %self.name, "address leaving paging mode");
            self.mode = AddressMode::Resident;
        }
        if let Some(writer) = self.writer.take() {
            self.reclaim_if_drained(writer.id);
        }
    }

    fn write_cursor(&self) -> io::Result<()> {
        let tmp = self.dir.join(format!("{CURSOR_FILE}.tmp"));
        fs::write(&tmp, self.cursor.to_le_bytes())?;
        fs::rename(&tmp, self.dir.join(CURSOR_FILE))
    }

    fn message(&self, stored: &StoredMessage, body: Vec<u8>) -> PagedMessage {
        let from_page = match &stored.body {
            BodyRef::Paged { page, .. } => Some(*page),
            BodyRef::Resident { .. } => None,
        };
        PagedMessage { address: self.name.clone(), sequence: stored.sequence, body, from_page }
    }

    /// Pops the oldest message, reading its body back from disk if paged.
    /// A resident message is deleted from `messages` before it leaves the
    /// queue.
    pub(crate) fn next(&mut self, messages: &Journal) -> PagingResult<Option<PagedMessage>> {
        let Some(front) = self.queue.front() else {
            return Ok(None);
        };
        let body = self.read_body(front)?;
        let message = self.message(front, body);
        if let BodyRef::Resident { record, .. } = front.body {
            messages.mark_deleted(record)?;
        }
        self.take(0);
        Ok(Some(message))
    }

    /// Like [`next`](Self::next), but only while paged messages remain.
    pub(crate) fn depage(&mut self, messages: &Journal) -> PagingResult<Option<PagedMessage>> {
        if self.paged_count == 0 {
            return Ok(None);
        }
        self.next(messages)
    }

    /// Mirrors a page write made on the live node. Writes can arrive out of
    /// sequence order during a resynchronisation; the queue stays sorted.
    pub(crate) fn apply_page_write(&mut self, sequence: u64, body: &[u8]) -> PagingResult<bool> {
        let Err(pos) = self.queue.binary_search_by_key(&sequence, |m| m.sequence) else {
            return Ok(false);
        };
        if self.mode != AddressMode::Paging && !self.enter_paging() {
            return Err(PagingError::PagingDisabled(self.name.clone()));
        }
        let body_ref = self.write_page(sequence, body).map_err(|e| self.disable_paging(e))?;
        self.queue.insert(pos, StoredMessage { sequence, body: body_ref });
        self.paged_count += 1;
        self.next_sequence = self.next_sequence.max(sequence + 1);
        Ok(true)
    }

    /// Mirrors the consumption of a paged message on the live node.
    pub(crate) fn apply_depage(&mut self, sequence: u64) -> bool {
        match self.queue.iter().position(|m| m.sequence == sequence) {
            Some(pos) => self.take(pos).is_some(),
            None => false,
        }
    }

    pub(crate) fn export_paged(&self) -> PagingResult<Vec<PagedMessage>> {
        self.queue
            .iter()
            .filter(|m| matches!(m.body, BodyRef::Paged { .. }))
            .map(|m| Ok(self.message(m, self.read_body(m)?)))
            .collect()
    }

    pub(crate) fn resume_paging(&mut self) {
        if self.mode == AddressMode::MemoryOnly {
            tracing::info!(address = %self.name, "paging re-enabled");
            self.mode = if self.paged_count > 0 { AddressMode::Paging } else { AddressMode::Resident };
        }
    }

    pub(crate) fn stats(&self) -> AddressStats {
        AddressStats {
            mode: self.mode,
            next_sequence: self.next_sequence,
            resident_messages: self.resident_count,
            resident_bytes: self.resident_bytes,
            paged_messages: self.paged_count,
            page_files: self.pages.len(),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }
}
