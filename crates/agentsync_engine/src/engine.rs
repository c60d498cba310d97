//! The synchronization state machine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handle::AgentSyncProtocol;
use crate::round::RoundSlot;
use crate::state::{RoundReport, SyncState, SyncStats};
use crate::throttle::EpsLimiter;
use crate::transport::Transport;
use agentsync_protocol::{Data, End, Message, Mode, Operation, Start, Status};
use agentsync_queue::{PersistedDiff, PersistentQueue};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs synchronization rounds for any number of modules over one queue.
///
/// A round is `Start`, one `Data` per pending row, `End`, then a blocking
/// wait for the manager's acknowledgment. Responses are handed in from
/// another thread through [`ProtocolEngine::parse_response_buffer`]. Rows
/// are removed from the queue only when an acknowledgment for the round
/// names their seq.
///
/// Rounds for the same module never overlap, even across engines sharing
/// the queue. Different modules synchronize concurrently.
pub struct ProtocolEngine {
    queue: Arc<PersistentQueue>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    rounds: Mutex<HashMap<String, Arc<RoundSlot>>>,
    states: RwLock<HashMap<String, SyncState>>,
    stats: RwLock<SyncStats>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Creates an engine sending through `transport`.
    pub fn new<T: Transport + 'static>(
        queue: Arc<PersistentQueue>,
        transport: T,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            transport: Arc::new(transport),
            config,
            rounds: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Returns a handle bound to one module.
    pub fn module(self: &Arc<Self>, module: impl Into<String>) -> AgentSyncProtocol {
        AgentSyncProtocol::new(module, Arc::clone(self))
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// State of the module's latest round.
    pub fn state(&self, module: &str) -> SyncState {
        self.states
            .read()
            .get(module)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    /// Engine-wide counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, module: &str, state: SyncState) {
        self.states.write().insert(module.to_string(), state);
    }

    /// Records a change for the next round and returns its seq.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidArgument`] for an empty module, id or index;
    /// queue errors (including duplicate pending ids) are propagated.
    pub fn persist_difference(
        &self,
        module: &str,
        id: &str,
        operation: Operation,
        index: &str,
        data: &str,
    ) -> SyncResult<u64> {
        for (field, value) in [("module", module), ("id", id), ("index", index)] {
            if value.is_empty() {
                return Err(SyncError::InvalidArgument(format!("{field} must not be empty")));
            }
        }
        let seq = self.queue.submit(module, id, index, data, operation)?;
        debug!(module, id, seq, %operation, "difference persisted");
        Ok(seq)
    }

    /// Drops every pending row of the module.
    ///
    /// Callers do this before a [`Mode::Full`] round when the manager must
    /// rebuild its view from scratch. A round already in flight keeps its
    /// snapshot; acknowledgments for removed rows are ignored.
    pub fn reset_module(&self, module: &str) -> SyncResult<usize> {
        let removed = self.queue.remove_all(module)?;
        info!(module, removed, "module reset");
        Ok(removed)
    }

    /// Runs one round for `module`.
    ///
    /// Start and End are sent up to `retries` times (at least once). The
    /// acknowledgment is awaited for at most `timeout` per attempt and
    /// `timeout * retries` overall; End is resent whenever a single wait
    /// elapses. `max_eps` caps Data frames per second, 0 for no cap.
    ///
    /// # Errors
    ///
    /// - [`SyncError::RoundInProgress`] if the module already has a round
    /// - [`SyncError::Transport`] if a frame could not be sent
    /// - [`SyncError::Rejected`] if the manager answered with an error
    /// - [`SyncError::Timeout`] if no acknowledgment arrived
    ///
    /// On any error the queue holds exactly the rows it held before.
    pub fn synchronize_module(
        &self,
        module: &str,
        mode: Mode,
        timeout: Duration,
        retries: u32,
        max_eps: usize,
    ) -> SyncResult<RoundReport> {
        if module.is_empty() {
            return Err(SyncError::InvalidArgument("module must not be empty".into()));
        }
        let Some(_claim) = self.queue.try_claim(module) else {
            warn!(module, "synchronization already in progress");
            return Err(SyncError::RoundInProgress {
                module: module.to_string(),
            });
        };

        let started = Instant::now();
        let result = self.run_round(module, mode, timeout, retries.max(1), max_eps, started);

        match &result {
            Ok(report) => {
                self.set_state(module, SyncState::Completed);
                let mut stats = self.stats.write();
                stats.rounds_completed += 1;
                stats.items_acknowledged += report.acknowledged as u64;
                stats.items_rejected += report.rejected as u64;
                stats.last_round_time = Some(Instant::now());
                stats.last_error = None;
                drop(stats);
                info!(
                    module,
                    session = report.session,
                    streamed = report.streamed,
                    acknowledged = report.acknowledged,
                    rejected = report.rejected,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "round completed"
                );
            }
            Err(e) => {
                self.set_state(module, SyncState::Failed);
                let mut stats = self.stats.write();
                stats.rounds_failed += 1;
                stats.last_round_time = Some(Instant::now());
                stats.last_error = Some(e.to_string());
                drop(stats);
                warn!(module, error = %e, retryable = e.is_retryable(), "round failed");
            }
        }
        result
    }

    fn run_round(
        &self,
        module: &str,
        mode: Mode,
        timeout: Duration,
        attempts: u32,
        max_eps: usize,
        started: Instant,
    ) -> SyncResult<RoundReport> {
        let snapshot = self.queue.fetch_all(module)?;
        let session = rand::thread_rng().gen_range(1..=u64::MAX);
        let slot = Arc::new(RoundSlot::new(
            session,
            snapshot.iter().map(|diff| diff.seq).collect(),
        ));
        let _registration = Registration::new(&self.rounds, module, Arc::clone(&slot));
        debug!(module, session, %mode, pending = slot.seqs().len(), "round started");

        let mut report = RoundReport {
            module: module.to_string(),
            session,
            mode,
            streamed: 0,
            retransmitted: 0,
            acknowledged: 0,
            rejected: 0,
            end_resends: 0,
            duration: Duration::ZERO,
        };

        self.set_state(module, SyncState::SendingStart);
        let start = Message::Start(Start {
            session,
            module: module.to_string(),
            mode,
            size: snapshot.len() as u64,
        })
        .encode()?;
        self.send_with_retry(module, &start, attempts, timeout)?;

        self.set_state(module, SyncState::StreamingData);
        let mut limiter = EpsLimiter::new(max_eps);
        for diff in &snapshot {
            self.send_data(module, session, diff, &mut limiter)?;
            self.stats.write().data_frames_sent += 1;
            report.streamed += 1;
        }

        self.set_state(module, SyncState::SendingEnd);
        let end = Message::End(End { session }).encode()?;
        self.send_with_retry(module, &end, attempts, timeout)?;

        self.set_state(module, SyncState::AwaitingAck);
        let round = ActiveRound {
            module,
            slot: &slot,
            snapshot: &snapshot,
            end: &end,
            timeout,
            attempts,
        };
        self.await_ack(&round, &mut limiter, &mut report)?;

        report.duration = started.elapsed();
        Ok(report)
    }

    fn send_data(
        &self,
        module: &str,
        session: u64,
        diff: &PersistedDiff,
        limiter: &mut EpsLimiter,
    ) -> SyncResult<()> {
        let frame = Message::Data(Data {
            session,
            seq: diff.seq,
            id: diff.id.clone(),
            index: diff.index.clone(),
            operation: diff.operation,
            data: diff.data.clone(),
        })
        .encode()?;
        limiter.acquire();
        self.transport.send_binary(module, &frame).map_err(|e| {
            debug!(module, session, seq = diff.seq, error = %e, "data frame not sent");
            e
        })
    }

    /// Sends a frame, backing off between failures.
    fn send_with_retry(
        &self,
        module: &str,
        frame: &[u8],
        attempts: u32,
        timeout: Duration,
    ) -> SyncResult<()> {
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(attempt).min(timeout);
                thread::sleep(delay);
                self.stats.write().send_retries += 1;
            }

            match self.transport.send_binary(module, frame) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    debug!(module, attempt, error = %e, "send failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::transport_retryable(match last_error {
            Some(e) => format!("gave up after {attempts} attempts: {e}"),
            None => format!("gave up after {attempts} attempts"),
        }))
    }

    fn await_ack(
        &self,
        round: &ActiveRound<'_>,
        limiter: &mut EpsLimiter,
        report: &mut RoundReport,
    ) -> SyncResult<()> {
        let module = round.module;
        let waiting_since = Instant::now();
        let budget = round
            .timeout
            .checked_mul(round.attempts)
            .unwrap_or(Duration::MAX);
        let deadline = waiting_since.checked_add(budget);

        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => round.timeout,
            };
            if remaining.is_zero() {
                return Err(SyncError::Timeout {
                    module: module.to_string(),
                    waited: waiting_since.elapsed(),
                });
            }

            let Some(message) = round.slot.wait(round.timeout.min(remaining)) else {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    continue;
                }
                debug!(module, session = report.session, "no acknowledgment yet, resending End");
                self.resend_end(round, report)?;
                continue;
            };

            match message {
                Message::StartAck(ack) if ack.status == Status::Error => {
                    return Err(SyncError::Rejected {
                        module: module.to_string(),
                        stage: "start",
                    });
                }
                Message::StartAck(_) => {
                    debug!(module, session = report.session, "start acknowledged");
                }
                Message::ReqRet(request) => {
                    let wanted = round.slot.seqs_in(&request.ranges);
                    debug!(module, session = report.session, count = wanted.len(), "retransmission requested");
                    for diff in round.snapshot.iter().filter(|d| wanted.contains(&d.seq)) {
                        self.send_data(module, report.session, diff, limiter)?;
                        self.stats.write().data_frames_retransmitted += 1;
                        report.retransmitted += 1;
                    }
                    self.resend_end(round, report)?;
                }
                Message::EndAck(ack) if ack.status == Status::Error => {
                    return Err(SyncError::Rejected {
                        module: module.to_string(),
                        stage: "end",
                    });
                }
                Message::EndAck(ack) => {
                    let rejected = round.slot.seqs_in(&ack.rejected);
                    let acknowledged = round.slot.seqs_in(&ack.acknowledged);
                    for seq in acknowledged.difference(&rejected) {
                        if self.queue.remove(module, *seq)? {
                            report.acknowledged += 1;
                        }
                    }
                    if !rejected.is_empty() {
                        warn!(
                            module,
                            session = report.session,
                            rejected = ?rejected,
                            "manager rejected items; they stay pending"
                        );
                    }
                    report.rejected = rejected.len();
                    return Ok(());
                }
                other => {
                    debug!(module, kind = ?other.message_type(), "ignoring unexpected frame");
                }
            }
        }
    }

    fn resend_end(&self, round: &ActiveRound<'_>, report: &mut RoundReport) -> SyncResult<()> {
        self.set_state(round.module, SyncState::SendingEnd);
        self.send_with_retry(round.module, round.end, round.attempts, round.timeout)?;
        self.set_state(round.module, SyncState::AwaitingAck);
        report.end_resends += 1;
        Ok(())
    }

    /// Hands a manager response to the round it belongs to.
    ///
    /// Safe to call from any thread. A response for a module without a
    /// round in flight is accepted and dropped.
    ///
    /// # Errors
    ///
    /// [`SyncError::Decode`] for a malformed buffer and
    /// [`SyncError::ResponseMismatch`] for a response that does not belong
    /// to the active round. Neither changes any state.
    pub fn parse_response_buffer(&self, buffer: &[u8]) -> SyncResult<()> {
        let message = match Message::decode(buffer) {
            Ok(message) => message,
            Err(e) => {
                self.stats.write().responses_discarded += 1;
                debug!(len = buffer.len(), error = %e, "undecodable response");
                return Err(e.into());
            }
        };

        let Some(module) = message.response_module().map(str::to_string) else {
            self.stats.write().responses_discarded += 1;
            return Err(SyncError::ResponseMismatch {
                module: String::new(),
                reason: format!("{:?} is not a manager response", message.message_type()),
            });
        };

        let slot = self.rounds.lock().get(&module).cloned();
        let Some(slot) = slot else {
            self.stats.write().responses_discarded += 1;
            debug!(module, session = message.session(), "no round in flight, response dropped");
            return Ok(());
        };

        if let Err(reason) = slot.check(&message) {
            self.stats.write().responses_discarded += 1;
            debug!(module, reason, "response does not match round");
            return Err(SyncError::ResponseMismatch { module, reason });
        }

        slot.deliver(message);
        Ok(())
    }
}

struct ActiveRound<'a> {
    module: &'a str,
    slot: &'a RoundSlot,
    snapshot: &'a [PersistedDiff],
    end: &'a [u8],
    timeout: Duration,
    attempts: u32,
}

/// Keeps a round's mailbox registered for its lifetime.
struct Registration<'a> {
    rounds: &'a Mutex<HashMap<String, Arc<RoundSlot>>>,
    module: String,
}

impl<'a> Registration<'a> {
    fn new(
        rounds: &'a Mutex<HashMap<String, Arc<RoundSlot>>>,
        module: &str,
        slot: Arc<RoundSlot>,
    ) -> Self {
        rounds.lock().insert(module.to_string(), slot);
        Self {
            rounds,
            module: module.to_string(),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.rounds.lock().remove(&self.module);
    }
}
