//! Error types for the diff queue.

use agentsync_storage::StorageError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur in queue and journal operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The journal is damaged before its tail.
    #[error("journal corruption at offset {offset}: {message}")]
    Corruption {
        /// Offset of the damaged record.
        offset: u64,
        /// Description of the damage.
        message: String,
    },

    /// A row with this id is already pending for the module.
    #[error("duplicate pending id {id:?} in module {module:?} (held by seq {seq})")]
    DuplicateId {
        /// Module name.
        module: String,
        /// The conflicting id.
        id: String,
        /// Seq of the row already holding the id.
        seq: u64,
    },

    /// A row with this seq is already pending for the module.
    #[error("duplicate pending seq {seq} in module {module:?}")]
    DuplicateSeq {
        /// Module name.
        module: String,
        /// The conflicting seq.
        seq: u64,
    },

    /// A caller-supplied value is not acceptable.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },
}

impl QueueError {
    /// Creates a corruption error.
    pub fn corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true for duplicate id or seq errors.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateId { .. } | Self::DuplicateSeq { .. })
    }
}
