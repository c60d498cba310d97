//! Row types.

use agentsync_protocol::Operation;

/// One pending change, scoped to a module.
///
/// The module is not part of the row; every storage call names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDiff {
    /// Storage sequence number. Zero asks storage to assign one.
    pub seq: u64,
    /// Logical identifier of the changed entity.
    pub id: String,
    /// Destination collection.
    pub index: String,
    /// Upsert or delete.
    pub operation: Operation,
    /// Opaque serialized document.
    pub data: String,
}

impl PersistedDiff {
    /// Creates a row without a seq; storage assigns one on save.
    pub fn new(
        id: impl Into<String>,
        index: impl Into<String>,
        operation: Operation,
        data: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            id: id.into(),
            index: index.into(),
            operation,
            data: data.into(),
        }
    }

    /// Sets an explicit seq.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}
