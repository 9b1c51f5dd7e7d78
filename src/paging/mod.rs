// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Paging manager.
//!
//! Keeps per-address message queues in memory until an address crosses its
//! high watermark, then writes that address's new messages straight to page
//! files until every paged message has been consumed again. Each address has
//! its own lock, so addresses page and depage independently.
//!
//! Resident messages are journaled in a dedicated message journal under the
//! paging directory. A restart restores the paged messages from the page
//! files and the resident ones from the message journal's live records.

pub mod page_file;
mod address;
mod resident;

use crate::config::PagingConfig;
use crate::error::{JournalResult, PagingError, PagingResult};
use crate::journal::{CompactionReport, Journal};
use crate::record::{JournalRecord, RecordBody};
use crate::types::id::{PageId, RecordId};
use address::{AddressStore, Limits, ADDRESS_FILE};
use rustc_hash::FxHashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    /// Messages are kept in memory.
    Resident,
    /// New messages go to page files.
    Paging,
    /// A page write failed; paging stays off until resumed.
    MemoryOnly,
}

/// Where a message body lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyRef {
    /// Held in memory and journaled as `record` in the message journal.
    Resident { body: Vec<u8>, record: RecordId },
    Paged { page: PageId, offset: u64, length: u32 },
}

/// A message handed back to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedMessage {
    pub address: String,
    pub sequence: u64,
    pub body: Vec<u8>,
    /// Page file the body was read from, `None` if it was resident.
    pub from_page: Option<PageId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    pub sequence: u64,
    pub paged: bool,
    /// Message journal record of a resident message.
    pub record: Option<RecordId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressStats {
    pub mode: AddressMode,
    pub next_sequence: u64,
    pub resident_messages: usize,
    pub resident_bytes: u64,
    pub paged_messages: usize,
    pub page_files: usize,
}

/// Called when paging fails for an address, with the address name.
pub type FailureHook = Arc<dyn Fn(&str, &PagingError) + Send + Sync>;

/// A change to the paged part of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingEvent<'a> {
    Paged { address: &'a str, sequence: u64, body: &'a [u8] },
    Depaged { address: &'a str, sequence: u64 },
}

/// Observer of paging events. Runs under the address lock, so it sees the
/// events of one address in the order they happened.
pub type EventHook = Arc<dyn Fn(PagingEvent<'_>) + Send + Sync>;

type SharedStore = Arc<Mutex<AddressStore>>;

fn lock(store: &SharedStore) -> MutexGuard<'_, AddressStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PagingManager {
    config: PagingConfig,
    addresses: RwLock<FxHashMap<String, SharedStore>>,
    messages: Journal,
    /// Address of every journaled resident message.
    owners: Mutex<FxHashMap<RecordId, String>>,
    on_failure: RwLock<Option<FailureHook>>,
    on_event: RwLock<Option<EventHook>>,
}

impl PagingManager {
    /// Opens the paging directory and restores every address that still has
    /// unconsumed messages, paged or resident.
    pub fn open(config: PagingConfig) -> PagingResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let limits = limits(&config);
        let mut stores = FxHashMap::default();

        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(ADDRESS_FILE).exists() {
                continue;
            }
            let store = AddressStore::recover(dir, limits)?;
            let stats = store.stats();
            tracing::info!(address = %store.name, paged = stats.paged_messages, "restored paged address");
            stores.insert(store.name.clone(), store);
        }

        let (messages, _) = Journal::open(config.message_journal())?;
        let mut owners = FxHashMap::default();
        for (id, entry) in messages.replay()?.into_live_set().records {
            let message = resident::decode(&entry.payload).ok_or(PagingError::BadMessageRecord(id))?;
            let store = stores.entry(message.address.clone()).or_insert_with(|| {
                AddressStore::new(message.address.clone(), address_dir(&config, &message.address), limits)
            });
            store.restore_resident(message.sequence, message.body, id);
            owners.insert(id, message.address);
        }
        if !owners.is_empty() {
            tracing::info!(resident = owners.len(), "restored resident messages");
        }

        let addresses = stores.into_iter().map(|(name, store)| (name, Arc::new(Mutex::new(store)))).collect();
        Ok(Self {
            config,
            addresses: RwLock::new(addresses),
            messages,
            owners: Mutex::new(owners),
            on_failure: RwLock::new(None),
            on_event: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Journal of resident messages. Replication streams its records to the
    /// backup next to the page writes.
    pub fn message_journal(&self) -> &Journal {
        &self.messages
    }

    fn owners(&self) -> MutexGuard<'_, FxHashMap<RecordId, String>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the operator notification for paging failures.
    pub fn set_failure_hook(&self, hook: impl Fn(&str, &PagingError) + Send + Sync + 'static) {
        let mut slot = self.on_failure.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(hook));
    }

    /// Installs or removes the observer of page writes and depages.
    pub fn set_event_hook(&self, hook: Option<EventHook>) {
        *self.on_event.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    fn event_hook(&self) -> Option<EventHook> {
        self.on_event.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn notify_failure(&self, address: &str, err: &PagingError) {
        tracing::error!(address, error = %err, "page write failed, address reverted to memory-only mode");
        let hook = self.on_failure.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(address, err);
        }
    }

    fn existing(&self, address: &str) -> Option<SharedStore> {
        self.addresses.read().unwrap_or_else(PoisonError::into_inner).get(address).cloned()
    }

    fn store_for(&self, address: &str) -> SharedStore {
        if let Some(store) = self.existing(address) {
            return store;
        }
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        addresses
            .entry(address.to_string())
            .or_insert_with(|| {
                let store = AddressStore::new(address.to_string(), address_dir(&self.config, address), limits(&self.config));
                Arc::new(Mutex::new(store))
            })
            .clone()
    }

    /// Accepts a message for `address`, paging it if the address is over its
    /// watermark or already paging.
    pub fn send(&self, address: &str, body: impl Into<Vec<u8>>) -> PagingResult<StoreOutcome> {
        if address.len() > resident::MAX_ADDRESS_LEN {
            return Err(PagingError::AddressTooLong(address.len()));
        }
        let store = self.store_for(address);
        let hook = self.event_hook();
        let mut store = lock(&store);
        let result = store.store(body.into(), &self.messages, |sequence, body| {
            if let Some(hook) = &hook {
                hook(PagingEvent::Paged { address, sequence, body });
            }
        });
        match &result {
            Ok(StoreOutcome { record: Some(record), .. }) => {
                self.owners().insert(*record, address.to_string());
            }
            Err(err @ PagingError::Io(_)) => self.notify_failure(address, err),
            _ => {}
        }
        result
    }

    /// Starts paging `address` now. Returns `PagingDisabled` if an earlier
    /// failure switched it to memory-only mode.
    pub fn on_memory_pressure(&self, address: &str) -> PagingResult<()> {
        let store = self.store_for(address);
        let mut store = lock(&store);
        if store.enter_paging() {
            Ok(())
        } else {
            tracing::warn!(address, "memory pressure on an address with paging disabled");
            Err(PagingError::PagingDisabled(address.to_string()))
        }
    }

    /// Next message of `address` in delivery order while any of its messages
    /// are paged; `None` once nothing is paged.
    pub fn depage(&self, address: &str) -> PagingResult<Option<PagedMessage>> {
        self.take(address, AddressStore::depage)
    }

    /// Next message of `address` in delivery order, resident or paged.
    pub fn next(&self, address: &str) -> PagingResult<Option<PagedMessage>> {
        self.take(address, AddressStore::next)
    }

    fn take(
        &self,
        address: &str,
        pop: fn(&mut AddressStore, &Journal) -> PagingResult<Option<PagedMessage>>,
    ) -> PagingResult<Option<PagedMessage>> {
        let Some(store) = self.existing(address) else {
            return Ok(None);
        };
        let mut store = lock(&store);
        let record = store.front_record();
        let Some(message) = pop(&mut store, &self.messages)? else {
            return Ok(None);
        };
        if message.from_page.is_some() {
            if let Some(hook) = self.event_hook() {
                hook(PagingEvent::Depaged { address, sequence: message.sequence });
            }
        } else if let Some(record) = record {
            self.owners().remove(&record);
        }
        Ok(Some(message))
    }

    /// Re-enables paging after an operator fixed the failure.
    pub fn resume_paging(&self, address: &str) {
        if let Some(store) = self.existing(address) {
            lock(&store).resume_paging();
        }
    }

    pub fn mode(&self, address: &str) -> Option<AddressMode> {
        self.existing(address).map(|store| lock(&store).mode)
    }

    pub fn stats(&self, address: &str) -> Option<AddressStats> {
        self.existing(address).map(|store| lock(&store).stats())
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.addresses.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    /// Backup side: applies a message journal record from the live node and
    /// mirrors it in the address queues. Returns `false` when the record was
    /// already applied.
    pub fn apply_message_record(&self, record: JournalRecord) -> PagingResult<bool> {
        let id = record.id;
        let message = match &record.body {
            RecordBody::Add { payload } => Some(resident::decode(payload).ok_or(PagingError::BadMessageRecord(id))?),
            _ => None,
        };
        let target = record.body.target();
        if !self.messages.apply_replicated(record)? {
            return Ok(false);
        }

        if let Some(message) = message {
            let store = self.store_for(&message.address);
            lock(&store).restore_resident(message.sequence, message.body, id);
            self.owners().insert(id, message.address);
        } else if let Some(target) = target {
            let owner = self.owners().remove(&target);
            if let Some(store) = owner.and_then(|address| self.existing(&address)) {
                lock(&store).forget_resident(target);
            }
        }
        Ok(true)
    }

    /// Backup side: stores a message the live node paged.
    pub fn apply_page_write(&self, address: &str, sequence: u64, body: &[u8]) -> PagingResult<bool> {
        let store = self.store_for(address);
        let result = lock(&store).apply_page_write(sequence, body);
        if let Err(err @ PagingError::Io(_)) = &result {
            self.notify_failure(address, err);
        }
        result
    }

    /// Backup side: drops a paged message the live node consumed.
    pub fn apply_depage(&self, address: &str, sequence: u64) -> bool {
        match self.existing(address) {
            Some(store) => lock(&store).apply_depage(sequence),
            None => false,
        }
    }

    /// Every paged message, per address in sequence order. Used to seed a
    /// backup.
    pub fn export_paged(&self) -> PagingResult<Vec<PagedMessage>> {
        let mut out = Vec::new();
        for address in self.addresses() {
            if let Some(store) = self.existing(&address) {
                out.extend(lock(&store).export_paged()?);
            }
        }
        Ok(out)
    }

    /// Rewrites sparse files of the message journal.
    pub fn compact_messages(&self) -> JournalResult<CompactionReport> {
        self.messages.compact()
    }

    /// Drops all addresses, their page files and the message journal.
    pub fn reset(&self) -> PagingResult<()> {
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        for (_, store) in addresses.drain() {
            let store = lock(&store);
            match fs::remove_dir_all(store.dir()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.owners().clear();
        self.messages.reset()?;
        Ok(())
    }
}

fn limits(config: &PagingConfig) -> Limits {
    Limits {
        max_messages: config.max_resident_messages,
        max_bytes: config.max_resident_bytes,
        page_size: config.page_size,
        sync: config.sync_writes,
    }
}

pub fn address_dir(config: &PagingConfig, address: &str) -> PathBuf {
    let hash = blake3::hash(address.as_bytes()).to_hex();
    config.dir.join(format!("addr-{}", &hash.as_str()[..16]))
}
