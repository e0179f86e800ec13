//! The backing cache: local records, entity rows and sync metadata.

use crate::backend::JournalBackend;
use crate::error::{CacheError, CacheResult};
use crate::feed::{ChangeFeed, CommitNotice, CommitOrigin};
use crate::file::FileBackend;
use crate::journal::{CommitFrame, Journal, JournalOp};
use crate::memory::InMemoryBackend;
use crate::model::{EntityRow, LocalRecord, RowId, SyncMetadata};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct CacheState {
    records: BTreeMap<String, LocalRecord>,
    rows: BTreeMap<RowId, EntityRow>,
    metadata: Option<SyncMetadata>,
    next_row_id: u64,
    sequence: u64,
}

impl CacheState {
    /// Applies a frame and describes what it changed.
    fn apply(&mut self, frame: CommitFrame) -> CommitNotice {
        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        let mut touched_rows = Vec::new();

        for op in frame.ops {
            match op {
                JournalOp::PutRecord(record) => {
                    let name = record.record_name().to_string();
                    if self.records.insert(name.clone(), record).is_some() {
                        updated.push(name);
                    } else {
                        inserted.push(name);
                    }
                }
                JournalOp::RemoveRecord(name) => {
                    if self.records.remove(&name).is_some() {
                        deleted.push(name);
                    }
                }
                JournalOp::PutRow(row) => {
                    self.next_row_id = self.next_row_id.max(row.row_id.0 + 1);
                    touched_rows.push(row.record_name.clone());
                    self.rows.insert(row.row_id, row);
                }
                JournalOp::RemoveRow(row_id) => {
                    if let Some(row) = self.rows.remove(&row_id) {
                        touched_rows.push(row.record_name);
                    }
                }
                JournalOp::SetMetadata(metadata) => self.metadata = Some(metadata),
            }
        }

        for name in touched_rows {
            if !inserted.contains(&name) && !updated.contains(&name) && !deleted.contains(&name) {
                updated.push(name);
            }
        }

        self.sequence = self.sequence.max(frame.sequence);
        CommitNotice {
            sequence: frame.sequence,
            origin: frame.origin,
            inserted,
            updated,
            deleted,
        }
    }
}

/// Transactional store of the sync engine's local state.
///
/// Writers are serialized: a transaction holds the journal for its whole
/// duration, so transactions never interleave. Readers see only committed
/// state. A commit is appended to the journal and synced before it becomes
/// visible, then announced through the change feed.
///
/// Do not start a transaction from inside another one on the same cache;
/// it would wait on itself.
pub struct BackingCache {
    state: RwLock<CacheState>,
    journal: Mutex<Journal>,
    feed: ChangeFeed,
}

impl BackingCache {
    /// Opens a cache whose journal lives in memory.
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()))
    }

    /// Opens (or creates) a cache backed by a journal file.
    pub fn open(path: &Path) -> CacheResult<Self> {
        let cache = Self::open_with_backend(Box::new(FileBackend::open(path)?))?;
        info!(path = %path.display(), records = cache.record_count(), "opened backing cache");
        Ok(cache)
    }

    /// Opens a cache on any journal backend, replaying its frames.
    pub fn open_with_backend(backend: Box<dyn JournalBackend>) -> CacheResult<Self> {
        let (journal, frames) = Journal::open(backend)?;
        let mut state = CacheState::default();
        let replayed = frames.len();
        for frame in frames {
            state.apply(frame);
        }
        debug!(frames = replayed, sequence = state.sequence, "replayed journal");

        Ok(Self {
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            feed: ChangeFeed::new(),
        })
    }

    /// Runs `f` in a write transaction.
    ///
    /// If `f` returns `Ok`, its writes are journaled and applied atomically;
    /// if it returns `Err`, nothing is written. Transactions without writes
    /// commit nothing and emit no notice.
    pub fn transaction<F, T, E>(&self, origin: CommitOrigin, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut CacheTransaction<'_>) -> Result<T, E>,
        E: From<CacheError>,
    {
        let mut journal = self.journal.lock();

        let (value, ops, next_row_id, sequence) = {
            let state = self.state.read();
            let mut txn = CacheTransaction::new(&state);
            let value = f(&mut txn)?;
            let next_row_id = txn.next_row_id;
            (value, txn.into_ops(), next_row_id, state.sequence + 1)
        };

        if ops.is_empty() {
            return Ok(value);
        }

        let frame = CommitFrame {
            sequence,
            origin,
            ops,
        };
        journal.append(&frame)?;

        let notice = {
            let mut state = self.state.write();
            state.next_row_id = state.next_row_id.max(next_row_id);
            state.apply(frame)
        };
        drop(journal);

        debug!(
            sequence = notice.sequence,
            origin = ?notice.origin,
            inserted = notice.inserted.len(),
            updated = notice.updated.len(),
            deleted = notice.deleted.len(),
            "cache commit"
        );
        self.feed.emit(notice);
        Ok(value)
    }

    /// Subscribes to commit notices.
    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        self.feed.subscribe()
    }

    /// Returns the change feed.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Returns the last committed sequence number.
    pub fn sequence(&self) -> u64 {
        self.state.read().sequence
    }

    /// Returns a local record by name.
    pub fn record(&self, record_name: &str) -> Option<LocalRecord> {
        self.state.read().records.get(record_name).cloned()
    }

    /// Returns all local records ordered by name.
    pub fn records(&self) -> Vec<LocalRecord> {
        self.state.read().records.values().cloned().collect()
    }

    /// Returns the number of local records.
    pub fn record_count(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns all dirty local records ordered by name.
    pub fn dirty_records(&self) -> Vec<LocalRecord> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.is_dirty())
            .cloned()
            .collect()
    }

    /// Returns an entity row.
    pub fn row(&self, row_id: RowId) -> Option<EntityRow> {
        self.state.read().rows.get(&row_id).cloned()
    }

    /// Returns all entity rows ordered by id.
    pub fn rows(&self) -> Vec<EntityRow> {
        self.state.read().rows.values().cloned().collect()
    }

    /// Returns the entity row owned by a local record.
    pub fn row_for_record(&self, record_name: &str) -> Option<EntityRow> {
        let state = self.state.read();
        let row_id = state.records.get(record_name)?.row?;
        state.rows.get(&row_id).cloned()
    }

    /// Returns the sync metadata.
    pub fn metadata(&self) -> Option<SyncMetadata> {
        self.state.read().metadata.clone()
    }

    /// Returns the journal size in bytes.
    pub fn journal_size(&self) -> CacheResult<u64> {
        self.journal.lock().size()
    }
}

/// Write view over the cache used inside [`BackingCache::transaction`].
///
/// Reads see committed state overlaid with this transaction's own writes.
pub struct CacheTransaction<'a> {
    base: &'a CacheState,
    records: BTreeMap<String, Option<LocalRecord>>,
    rows: BTreeMap<RowId, Option<EntityRow>>,
    metadata: Option<SyncMetadata>,
    next_row_id: u64,
}

impl<'a> CacheTransaction<'a> {
    fn new(base: &'a CacheState) -> Self {
        Self {
            base,
            records: BTreeMap::new(),
            rows: BTreeMap::new(),
            metadata: None,
            next_row_id: base.next_row_id.max(1),
        }
    }

    fn into_ops(self) -> Vec<JournalOp> {
        let mut ops = Vec::with_capacity(self.records.len() + self.rows.len() + 1);
        for (name, record) in self.records {
            ops.push(match record {
                Some(record) => JournalOp::PutRecord(record),
                None => JournalOp::RemoveRecord(name),
            });
        }
        for (row_id, row) in self.rows {
            ops.push(match row {
                Some(row) => JournalOp::PutRow(row),
                None => JournalOp::RemoveRow(row_id),
            });
        }
        if let Some(metadata) = self.metadata {
            ops.push(JournalOp::SetMetadata(metadata));
        }
        ops
    }

    /// Returns true if the transaction has written nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rows.is_empty() && self.metadata.is_none()
    }

    /// Looks up a local record by name.
    pub fn record(&self, record_name: &str) -> Option<&LocalRecord> {
        match self.records.get(record_name) {
            Some(overlay) => overlay.as_ref(),
            None => self.base.records.get(record_name),
        }
    }

    /// Returns all visible local records ordered by name.
    pub fn records(&self) -> Vec<&LocalRecord> {
        let mut out: Vec<&LocalRecord> = self
            .base
            .records
            .iter()
            .filter(|(name, _)| !self.records.contains_key(*name))
            .map(|(_, record)| record)
            .collect();
        out.extend(self.records.values().flatten());
        out.sort_by(|a, b| a.record_name().cmp(b.record_name()));
        out
    }

    /// Inserts or replaces a local record.
    pub fn put_record(&mut self, record: LocalRecord) {
        self.records
            .insert(record.record_name().to_string(), Some(record));
    }

    /// Removes a local record.
    pub fn remove_record(&mut self, record_name: &str) {
        if self.record(record_name).is_some() {
            self.records.insert(record_name.to_string(), None);
        }
    }

    /// Looks up an entity row.
    pub fn row(&self, row_id: RowId) -> Option<&EntityRow> {
        match self.rows.get(&row_id) {
            Some(overlay) => overlay.as_ref(),
            None => self.base.rows.get(&row_id),
        }
    }

    /// Looks up an entity row, failing if it does not exist.
    pub fn require_row(&self, row_id: RowId) -> CacheResult<&EntityRow> {
        self.row(row_id).ok_or(CacheError::RowNotFound(row_id.0))
    }

    /// Returns all visible entity rows ordered by id.
    pub fn rows(&self) -> Vec<&EntityRow> {
        let mut out: Vec<&EntityRow> = self
            .base
            .rows
            .iter()
            .filter(|(id, _)| !self.rows.contains_key(*id))
            .map(|(_, row)| row)
            .collect();
        out.extend(self.rows.values().flatten());
        out.sort_by_key(|row| row.row_id);
        out
    }

    /// Returns the entity row owned by a local record.
    pub fn row_for_record(&self, record_name: &str) -> Option<&EntityRow> {
        self.row(self.record(record_name)?.row?)
    }

    /// Returns the local record owning an entity row.
    pub fn record_for_row(&self, row_id: RowId) -> Option<&LocalRecord> {
        self.record(&self.row(row_id)?.record_name)
    }

    /// Reserves a fresh row id.
    pub fn allocate_row_id(&mut self) -> RowId {
        let id = RowId(self.next_row_id);
        self.next_row_id += 1;
        id
    }

    /// Inserts or replaces an entity row.
    pub fn put_row(&mut self, row: EntityRow) {
        self.next_row_id = self.next_row_id.max(row.row_id.0 + 1);
        self.rows.insert(row.row_id, Some(row));
    }

    /// Removes an entity row.
    pub fn remove_row(&mut self, row_id: RowId) {
        if self.row(row_id).is_some() {
            self.rows.insert(row_id, None);
        }
    }

    /// Returns the sync metadata.
    pub fn metadata(&self) -> Option<&SyncMetadata> {
        self.metadata.as_ref().or(self.base.metadata.as_ref())
    }

    /// Replaces the sync metadata.
    pub fn set_metadata(&mut self, metadata: SyncMetadata) {
        self.metadata = Some(metadata);
    }
}
