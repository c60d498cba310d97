//! Round states and statistics.

use agentsync_protocol::Mode;
use std::time::{Duration, Instant};

/// Where a module's latest round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No round has run yet.
    Idle,
    /// Sending the Start frame.
    SendingStart,
    /// Streaming Data frames.
    StreamingData,
    /// Sending the End frame.
    SendingEnd,
    /// Waiting for the manager's acknowledgment.
    AwaitingAck,
    /// The last round finished and was reconciled.
    Completed,
    /// The last round failed; nothing was removed for it.
    Failed,
}

impl SyncState {
    /// Returns true while a round is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::SendingStart
                | SyncState::StreamingData
                | SyncState::SendingEnd
                | SyncState::AwaitingAck
        )
    }

    /// Returns true if a new round may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Rounds that ended with a reconciled acknowledgment.
    pub rounds_completed: u64,
    /// Rounds that failed.
    pub rounds_failed: u64,
    /// Data frames sent, first transmissions only.
    pub data_frames_sent: u64,
    /// Data frames resent on manager request.
    pub data_frames_retransmitted: u64,
    /// Rows removed on acknowledgment.
    pub items_acknowledged: u64,
    /// Rows the manager reported as rejected.
    pub items_rejected: u64,
    /// Failed Start/End send attempts that were retried.
    pub send_retries: u64,
    /// Response buffers dropped as malformed, mismatched or stale.
    pub responses_discarded: u64,
    /// When the last round ended.
    pub last_round_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of one successful round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// Module of the round.
    pub module: String,
    /// Session id the round used.
    pub session: u64,
    /// Mode announced in Start.
    pub mode: Mode,
    /// Data frames streamed.
    pub streamed: usize,
    /// Data frames resent on manager request.
    pub retransmitted: usize,
    /// Rows removed on acknowledgment.
    pub acknowledged: usize,
    /// Rows the manager rejected; they stay pending.
    pub rejected: usize,
    /// Extra End frames sent after silence or a retransmission.
    pub end_resends: usize,
    /// Wall time of the round.
    pub duration: Duration,
}
