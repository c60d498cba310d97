//! Process-wide queue façade over [`DiffStorage`].

use crate::compaction::CompactionResult;
use crate::config::StorageConfig;
use crate::error::QueueResult;
use crate::storage::{DiffStorage, JournalStorage};
use crate::types::PersistedDiff;
use agentsync_protocol::{Operation, SeqRange};
use agentsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Storage path selecting the in-memory backend.
pub const MEMORY_PATH: &str = ":memory:";

/// Thread-safe queue of pending diffs shared by every module engine.
///
/// All calls are serialized through one lock, held only for the duration of
/// a single storage call. The queue also tracks which modules have a
/// synchronization round in flight (see [`PersistentQueue::try_claim`]).
///
/// # Example
///
/// ```rust
/// use agentsync_protocol::Operation;
/// use agentsync_queue::PersistentQueue;
///
/// let queue = PersistentQueue::open(":memory:").unwrap();
/// let seq = queue.submit("FIM", "a", "fim_file", "{}", Operation::Upsert).unwrap();
/// assert_eq!(queue.fetch_all("FIM").unwrap()[0].seq, seq);
/// ```
pub struct PersistentQueue {
    storage: Mutex<Box<dyn DiffStorage>>,
    claims: Arc<Mutex<HashSet<String>>>,
    location: String,
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl PersistentQueue {
    /// Wraps an existing storage.
    pub fn new(storage: Box<dyn DiffStorage>, location: impl Into<String>) -> Self {
        Self {
            storage: Mutex::new(storage),
            claims: Arc::default(),
            location: location.into(),
        }
    }

    /// Opens the store at `path` with default configuration.
    ///
    /// `":memory:"` selects a fresh in-memory store.
    pub fn open(path: &str) -> QueueResult<Self> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Opens the store at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or locked, or if the journal is
    /// corrupted.
    pub fn open_with_config(path: &str, config: StorageConfig) -> QueueResult<Self> {
        let backend: Box<dyn StorageBackend> = if path == MEMORY_PATH {
            Box::new(InMemoryBackend::new())
        } else {
            Box::new(FileBackend::open(Path::new(path))?)
        };
        let storage = JournalStorage::open(backend, config)?;
        debug!(path, "queue opened");
        Ok(Self::new(Box::new(storage), path))
    }

    /// Path or `":memory:"` this queue was opened from.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Stores a new diff and returns its assigned seq.
    pub fn submit(
        &self,
        module: &str,
        id: &str,
        index: &str,
        data: &str,
        operation: Operation,
    ) -> QueueResult<u64> {
        self.save(module, PersistedDiff::new(id, index, operation, data))
    }

    /// Stores a row, assigning a seq if `diff.seq` is zero.
    pub fn save(&self, module: &str, diff: PersistedDiff) -> QueueResult<u64> {
        self.storage.lock().save(module, diff)
    }

    /// Every pending row of the module, ascending seq.
    pub fn fetch_all(&self, module: &str) -> QueueResult<Vec<PersistedDiff>> {
        self.storage.lock().load_all(module)
    }

    /// Pending rows inside any of `ranges`, ascending seq, without duplicates.
    pub fn fetch_range(&self, module: &str, ranges: &[SeqRange]) -> QueueResult<Vec<PersistedDiff>> {
        let mut sorted: Vec<SeqRange> = ranges.iter().copied().filter(SeqRange::is_valid).collect();
        sorted.sort();

        let storage = self.storage.lock();
        let mut rows: Vec<PersistedDiff> = Vec::new();
        for range in sorted {
            for diff in storage.load_range(module, range.begin, range.end)? {
                if rows.last().map_or(true, |last| last.seq < diff.seq) {
                    rows.push(diff);
                }
            }
        }
        Ok(rows)
    }

    /// Removes one row; a missing seq is a no-op returning false.
    pub fn remove(&self, module: &str, seq: u64) -> QueueResult<bool> {
        self.storage.lock().remove(module, seq)
    }

    /// Removes every row of the module.
    pub fn remove_all(&self, module: &str) -> QueueResult<usize> {
        self.storage.lock().remove_all(module)
    }

    /// Number of pending rows in the module.
    pub fn pending_count(&self, module: &str) -> QueueResult<usize> {
        self.storage.lock().pending_count(module)
    }

    /// Modules with pending rows.
    pub fn modules(&self) -> QueueResult<Vec<String>> {
        self.storage.lock().modules()
    }

    /// Compacts the underlying store.
    pub fn compact(&self) -> QueueResult<CompactionResult> {
        self.storage.lock().compact()
    }

    /// Marks a round for `module` as in flight.
    ///
    /// Returns `None` if a round for the module is already in flight. The
    /// mark is cleared when the returned claim is dropped.
    #[must_use]
    pub fn try_claim(&self, module: &str) -> Option<ModuleClaim> {
        let mut claims = self.claims.lock();
        if !claims.insert(module.to_string()) {
            return None;
        }
        Some(ModuleClaim {
            module: module.to_string(),
            claims: Arc::clone(&self.claims),
        })
    }

    /// Returns true if a round for `module` is in flight.
    #[must_use]
    pub fn is_claimed(&self, module: &str) -> bool {
        self.claims.lock().contains(module)
    }
}

/// Exclusive right to run a round for one module.
#[derive(Debug)]
pub struct ModuleClaim {
    module: String,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl ModuleClaim {
    /// The claimed module.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }
}

impl Drop for ModuleClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.module);
    }
}
