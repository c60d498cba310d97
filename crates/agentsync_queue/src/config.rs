//! Storage configuration.

/// Configuration for a journal-backed store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Whether to sync the backend after every record (safer but slower).
    pub sync_on_write: bool,

    /// Minimum number of dead records before automatic compaction.
    pub compaction_min_dead: usize,

    /// Dead records must be at least `live * compaction_ratio` to compact.
    pub compaction_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compaction_min_dead: 1024,
            compaction_ratio: 1.0,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync after every record.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the dead-record floor for compaction.
    #[must_use]
    pub const fn compaction_min_dead(mut self, value: usize) -> Self {
        self.compaction_min_dead = value;
        self
    }

    /// Sets the dead/live ratio for compaction.
    #[must_use]
    pub const fn compaction_ratio(mut self, value: f64) -> Self {
        self.compaction_ratio = value;
        self
    }

    /// Disables automatic compaction.
    #[must_use]
    pub const fn without_auto_compaction(mut self) -> Self {
        self.compaction_min_dead = usize::MAX;
        self
    }

    /// Returns true if a journal with these counts should be compacted.
    #[must_use]
    pub fn should_compact(&self, dead: usize, live: usize) -> bool {
        dead >= self.compaction_min_dead && dead as f64 >= live as f64 * self.compaction_ratio
    }
}
