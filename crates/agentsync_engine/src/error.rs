//! Error types for the protocol engine.

use agentsync_protocol::ProtocolError;
use agentsync_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while persisting or synchronizing diffs.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport refused a frame.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Queue or storage failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A response buffer could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// A well-formed response does not match the active round.
    #[error("response does not match round for module {module:?}: {reason}")]
    ResponseMismatch {
        /// Module named by the response.
        module: String,
        /// What did not match.
        reason: String,
    },

    /// A round for the module is already in flight.
    #[error("synchronization already in progress for module {module:?}")]
    RoundInProgress {
        /// The busy module.
        module: String,
    },

    /// No acknowledgment arrived within the round's budget.
    #[error("no acknowledgment for module {module:?} within {waited:?}")]
    Timeout {
        /// Module of the round.
        module: String,
        /// How long the round waited.
        waited: Duration,
    },

    /// The manager answered with an error status.
    #[error("manager rejected {stage} for module {module:?}")]
    Rejected {
        /// Module of the round.
        module: String,
        /// Which reply carried the error.
        stage: &'static str,
    },

    /// A caller-supplied value is not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a later round may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout { .. }
            | SyncError::Rejected { .. }
            | SyncError::RoundInProgress { .. } => true,
            _ => false,
        }
    }

    /// Returns true for decode and mismatch failures of a response buffer.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, SyncError::Decode(_) | SyncError::ResponseMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("queue closed").is_retryable());
        assert!(!SyncError::transport_fatal("no queue").is_retryable());
        assert!(SyncError::Timeout {
            module: "FIM".into(),
            waited: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!SyncError::InvalidArgument("empty id".into()).is_retryable());
    }

    #[test]
    fn decode_failures() {
        assert!(SyncError::Decode(ProtocolError::UnknownMessageType(9)).is_decode_failure());
        assert!(SyncError::ResponseMismatch {
            module: "FIM".into(),
            reason: "session".into()
        }
        .is_decode_failure());
        assert!(!SyncError::transport_fatal("x").is_decode_failure());
    }

    #[test]
    fn error_display() {
        let err = SyncError::RoundInProgress {
            module: "FIM".into(),
        };
        assert_eq!(
            err.to_string(),
            "synchronization already in progress for module \"FIM\""
        );
    }
}
