//! Journal compaction.
//!
//! Compaction rewrites the journal so it holds only what replay needs: one
//! `Watermark` per module that has ever assigned a seq, followed by the
//! module's live rows in ascending seq order.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** change logical state
//! - Seqs are never reused afterwards: the watermark carries `next_seq`

use crate::journal::JournalRecord;
use crate::types::PersistedDiff;

/// Result of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records in the journal before compaction.
    pub input_records: usize,
    /// Records written by compaction.
    pub output_records: usize,
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction.
    pub bytes_after: u64,
}

impl CompactionResult {
    /// Bytes reclaimed.
    #[must_use]
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Snapshot of one module as compaction sees it.
#[derive(Debug)]
pub struct ModuleImage<'a> {
    /// Module name.
    pub module: &'a str,
    /// Next seq the module would assign.
    pub next_seq: u64,
    /// Live rows in ascending seq order.
    pub rows: Vec<&'a PersistedDiff>,
}

/// Builds the record list that replaces the journal.
///
/// Modules that never assigned a seq and hold no rows are dropped.
#[must_use]
pub fn compacted_records(modules: Vec<ModuleImage<'_>>) -> Vec<JournalRecord> {
    let mut records = Vec::new();

    for image in modules {
        if image.next_seq <= 1 && image.rows.is_empty() {
            continue;
        }
        records.push(JournalRecord::Watermark {
            module: image.module.to_string(),
            next_seq: image.next_seq,
        });
        records.extend(image.rows.into_iter().map(|diff| JournalRecord::Put {
            module: image.module.to_string(),
            diff: diff.clone(),
        }));
    }

    records
}
