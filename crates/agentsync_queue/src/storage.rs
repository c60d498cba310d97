//! Diff storage contract and its journal-backed implementation.

use crate::compaction::{compacted_records, CompactionResult, ModuleImage};
use crate::config::StorageConfig;
use crate::error::{QueueError, QueueResult};
use crate::journal::{JournalReader, JournalRecord};
use crate::types::PersistedDiff;
use agentsync_storage::{InMemoryBackend, StorageBackend};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Transactional table of pending diffs, keyed per module.
///
/// Every mutating call is all-or-nothing: on error the stored rows are
/// exactly what they were before the call.
pub trait DiffStorage: Send {
    /// Inserts a row and returns its seq.
    ///
    /// A `diff.seq` of zero asks storage to assign the next seq for the
    /// module.
    ///
    /// # Errors
    ///
    /// - [`QueueError::DuplicateId`] if a pending row already has `diff.id`
    /// - [`QueueError::DuplicateSeq`] if a pending row already has `diff.seq`
    /// - [`QueueError::Storage`] if the write fails
    fn save(&mut self, module: &str, diff: PersistedDiff) -> QueueResult<u64>;

    /// Returns every pending row of the module in ascending seq order.
    fn load_all(&self, module: &str) -> QueueResult<Vec<PersistedDiff>>;

    /// Returns pending rows with `begin <= seq <= end`, ascending.
    fn load_range(&self, module: &str, begin: u64, end: u64) -> QueueResult<Vec<PersistedDiff>> {
        Ok(self
            .load_all(module)?
            .into_iter()
            .filter(|diff| begin <= diff.seq && diff.seq <= end)
            .collect())
    }

    /// Removes one row. Returns false if no such row was pending.
    fn remove(&mut self, module: &str, seq: u64) -> QueueResult<bool>;

    /// Removes every row of the module and returns how many were removed.
    fn remove_all(&mut self, module: &str) -> QueueResult<usize>;

    /// Number of pending rows in the module.
    fn pending_count(&self, module: &str) -> QueueResult<usize>;

    /// Modules that have pending rows, sorted by name.
    fn modules(&self) -> QueueResult<Vec<String>>;

    /// Rewrites the underlying store without dead records.
    fn compact(&mut self) -> QueueResult<CompactionResult>;
}

#[derive(Debug)]
struct ModuleTable {
    rows: BTreeMap<u64, PersistedDiff>,
    ids: HashMap<String, u64>,
    next_seq: u64,
}

impl ModuleTable {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            ids: HashMap::new(),
            next_seq: 1,
        }
    }

    fn observe_seq(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
    }
}

/// [`DiffStorage`] over an append-only journal.
///
/// The whole row set lives in memory and every mutation is appended to the
/// backend as one journal record before it is applied. Opening a store
/// replays the journal; a torn final record is cut off.
///
/// # Example
///
/// ```rust
/// use agentsync_protocol::Operation;
/// use agentsync_queue::{DiffStorage, JournalStorage, PersistedDiff};
///
/// let mut storage = JournalStorage::in_memory();
/// let seq = storage
///     .save("FIM", PersistedDiff::new("a", "fim_file", Operation::Upsert, "{}"))
///     .unwrap();
/// assert_eq!(seq, 1);
/// assert_eq!(storage.load_all("FIM").unwrap().len(), 1);
/// ```
pub struct JournalStorage {
    backend: Box<dyn StorageBackend>,
    config: StorageConfig,
    tables: BTreeMap<String, ModuleTable>,
    /// Records currently in the journal.
    records: usize,
    /// Records that no longer contribute to the row set.
    dead: usize,
    live: usize,
}

impl std::fmt::Debug for JournalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStorage")
            .field("modules", &self.tables.len())
            .field("records", &self.records)
            .field("dead", &self.dead)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl JournalStorage {
    /// Opens a store by replaying the journal held in `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Corruption`] if a record before the tail is
    /// damaged or the records contradict each other.
    pub fn open(backend: Box<dyn StorageBackend>, config: StorageConfig) -> QueueResult<Self> {
        let bytes = backend.read_all()?;
        let mut storage = Self {
            backend,
            config,
            tables: BTreeMap::new(),
            records: 0,
            dead: 0,
            live: 0,
        };

        let mut reader = JournalReader::new(&bytes);
        for item in reader.by_ref() {
            let (offset, record) = item?;
            storage.apply(record, offset)?;
        }

        let torn = reader.torn_len();
        if torn > 0 {
            warn!(
                valid_len = reader.valid_len(),
                torn_bytes = torn,
                "discarding torn journal tail"
            );
            storage.backend.truncate(reader.valid_len())?;
        }

        debug!(
            records = storage.records,
            live = storage.live,
            modules = storage.tables.len(),
            "journal replayed"
        );
        Ok(storage)
    }

    /// Creates an empty store in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            config: StorageConfig::default(),
            tables: BTreeMap::new(),
            records: 0,
            dead: 0,
            live: 0,
        }
    }

    /// Current journal size in bytes.
    pub fn journal_size(&self) -> QueueResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Records currently in the journal.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Records that compaction would drop.
    #[must_use]
    pub fn dead_records(&self) -> usize {
        self.dead
    }

    /// Next seq `module` would assign.
    #[must_use]
    pub fn next_seq(&self, module: &str) -> u64 {
        self.tables.get(module).map_or(1, |t| t.next_seq)
    }

    /// Applies a record to the in-memory tables. Contradictions are
    /// reported as corruption at `offset`.
    fn apply(&mut self, record: JournalRecord, offset: u64) -> QueueResult<()> {
        match record {
            JournalRecord::Put { module, diff } => {
                let table = self.tables.entry(module).or_insert_with(ModuleTable::new);
                if table.rows.contains_key(&diff.seq) {
                    return Err(QueueError::corruption(
                        offset,
                        format!("seq {} inserted twice", diff.seq),
                    ));
                }
                if table.ids.contains_key(&diff.id) {
                    return Err(QueueError::corruption(
                        offset,
                        format!("id {:?} inserted twice", diff.id),
                    ));
                }
                table.observe_seq(diff.seq);
                table.ids.insert(diff.id.clone(), diff.seq);
                table.rows.insert(diff.seq, diff);
                self.live += 1;
            }
            JournalRecord::Remove { module, seq } => {
                let removed = self
                    .tables
                    .get_mut(&module)
                    .and_then(|table| table.rows.remove(&seq).map(|diff| (table, diff)));
                match removed {
                    Some((table, diff)) => {
                        table.ids.remove(&diff.id);
                        self.live -= 1;
                        self.dead += 2;
                    }
                    None => self.dead += 1,
                }
            }
            JournalRecord::RemoveAll { module } => {
                let removed = self.tables.get_mut(&module).map_or(0, |table| {
                    table.ids.clear();
                    std::mem::take(&mut table.rows).len()
                });
                self.live -= removed;
                self.dead += removed + 1;
            }
            JournalRecord::Watermark { module, next_seq } => {
                let table = self.tables.entry(module).or_insert_with(ModuleTable::new);
                table.next_seq = table.next_seq.max(next_seq);
            }
        }
        self.records += 1;
        Ok(())
    }

    /// Appends a record and returns its offset, rolling the backend back if
    /// the write fails.
    fn append(&mut self, record: &JournalRecord) -> QueueResult<u64> {
        let frame = record.encode_frame()?;
        let before = self.backend.size()?;

        let mut result = self.backend.append(&frame).map(|_| ());
        if result.is_ok() && self.config.sync_on_write {
            result = self.backend.sync();
        }

        if let Err(err) = result {
            self.roll_back(before);
            return Err(err.into());
        }
        Ok(before)
    }

    fn roll_back(&mut self, len: u64) {
        if let Err(rollback) = self.backend.truncate(len) {
            warn!(error = %rollback, "failed to roll back journal append");
        }
    }

    /// Appends then applies. A record that the tables refuse is cut from the
    /// journal again, so a rejected mutation never survives a reopen.
    fn commit(&mut self, record: JournalRecord) -> QueueResult<()> {
        let offset = self.append(&record)?;
        if let Err(err) = self.apply(record, offset) {
            self.roll_back(offset);
            return Err(err);
        }
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if !self.config.should_compact(self.dead, self.live) {
            return;
        }
        if let Err(e) = self.compact() {
            warn!(error = %e, "automatic compaction failed");
        }
    }
}

fn validate_module(module: &str) -> QueueResult<()> {
    if module.is_empty() {
        return Err(QueueError::invalid_argument("module name is empty"));
    }
    Ok(())
}

impl DiffStorage for JournalStorage {
    fn save(&mut self, module: &str, mut diff: PersistedDiff) -> QueueResult<u64> {
        validate_module(module)?;
        if diff.id.is_empty() {
            return Err(QueueError::invalid_argument("diff id is empty"));
        }
        if diff.seq == u64::MAX {
            return Err(QueueError::invalid_argument("seq out of range"));
        }

        if let Some(table) = self.tables.get(module) {
            if let Some(&seq) = table.ids.get(&diff.id) {
                return Err(QueueError::DuplicateId {
                    module: module.to_string(),
                    id: diff.id,
                    seq,
                });
            }
            if diff.seq != 0 && table.rows.contains_key(&diff.seq) {
                return Err(QueueError::DuplicateSeq {
                    module: module.to_string(),
                    seq: diff.seq,
                });
            }
        }

        if diff.seq == 0 {
            diff.seq = self.next_seq(module);
            if diff.seq == u64::MAX {
                return Err(QueueError::invalid_argument(format!(
                    "seq space of module {module:?} is exhausted"
                )));
            }
            if self
                .tables
                .get(module)
                .is_some_and(|table| table.rows.contains_key(&diff.seq))
            {
                return Err(QueueError::DuplicateSeq {
                    module: module.to_string(),
                    seq: diff.seq,
                });
            }
        }
        let seq = diff.seq;

        self.commit(JournalRecord::Put {
            module: module.to_string(),
            diff,
        })?;
        debug!(module, seq, "diff saved");
        Ok(seq)
    }

    fn load_all(&self, module: &str) -> QueueResult<Vec<PersistedDiff>> {
        Ok(self
            .tables
            .get(module)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_range(&self, module: &str, begin: u64, end: u64) -> QueueResult<Vec<PersistedDiff>> {
        if begin > end {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .get(module)
            .map(|table| table.rows.range(begin..=end).map(|(_, d)| d.clone()).collect())
            .unwrap_or_default())
    }

    fn remove(&mut self, module: &str, seq: u64) -> QueueResult<bool> {
        let pending = self
            .tables
            .get(module)
            .is_some_and(|table| table.rows.contains_key(&seq));
        if !pending {
            return Ok(false);
        }

        self.commit(JournalRecord::Remove {
            module: module.to_string(),
            seq,
        })?;
        debug!(module, seq, "diff removed");
        self.maybe_compact();
        Ok(true)
    }

    fn remove_all(&mut self, module: &str) -> QueueResult<usize> {
        let count = self.pending_count(module)?;
        if count == 0 {
            return Ok(0);
        }

        self.commit(JournalRecord::RemoveAll {
            module: module.to_string(),
        })?;
        info!(module, removed = count, "module reset");
        self.maybe_compact();
        Ok(count)
    }

    fn pending_count(&self, module: &str) -> QueueResult<usize> {
        Ok(self.tables.get(module).map_or(0, |table| table.rows.len()))
    }

    fn modules(&self) -> QueueResult<Vec<String>> {
        Ok(self
            .tables
            .iter()
            .filter(|(_, table)| !table.rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn compact(&mut self) -> QueueResult<CompactionResult> {
        let bytes_before = self.backend.size()?;
        let input_records = self.records;

        let images = self
            .tables
            .iter()
            .map(|(module, table)| ModuleImage {
                module,
                next_seq: table.next_seq,
                rows: table.rows.values().collect(),
            })
            .collect();
        let records = compacted_records(images);

        let mut image = Vec::new();
        for record in &records {
            image.extend_from_slice(&record.encode_frame()?);
        }
        self.backend.replace(&image)?;

        self.records = records.len();
        self.dead = 0;
        self.tables
            .retain(|_, table| table.next_seq > 1 || !table.rows.is_empty());

        let result = CompactionResult {
            input_records,
            output_records: records.len(),
            bytes_before,
            bytes_after: self.backend.size()?,
        };
        info!(
            input_records = result.input_records,
            output_records = result.output_records,
            bytes_saved = result.bytes_saved(),
            "journal compacted"
        );
        Ok(result)
    }
}
