//! Response handoff between the delivery path and a blocked round.

use agentsync_protocol::{Message, SeqRange};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Mailbox of one in-flight round.
///
/// Registered before the round's Start frame is sent and removed when the
/// round ends, so every response for the round finds it.
///
/// # Wake-one contract
///
/// Exactly one thread, the round's own, ever waits on a slot. The delivery
/// path queues a response under the mailbox lock and then signals, so a
/// response that arrives before the round starts waiting is not lost.
#[derive(Debug)]
pub(crate) struct RoundSlot {
    session: u64,
    seqs: BTreeSet<u64>,
    inbox: Mutex<VecDeque<Message>>,
    signal: Condvar,
}

impl RoundSlot {
    /// Creates a slot for a round streaming `seqs` under `session`.
    pub(crate) fn new(session: u64, seqs: BTreeSet<u64>) -> Self {
        Self {
            session,
            seqs,
            inbox: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    /// Seqs in the round's snapshot.
    pub(crate) fn seqs(&self) -> &BTreeSet<u64> {
        &self.seqs
    }

    /// Seqs of the snapshot inside `ranges`, ascending.
    pub(crate) fn seqs_in(&self, ranges: &[SeqRange]) -> BTreeSet<u64> {
        ranges
            .iter()
            .filter(|range| range.is_valid())
            .flat_map(|range| self.seqs.range(range.begin..=range.end).copied())
            .collect()
    }

    /// Checks that a response belongs to this round.
    pub(crate) fn check(&self, message: &Message) -> Result<(), String> {
        if message.session() != self.session {
            return Err(format!(
                "session {} does not match active session {}",
                message.session(),
                self.session
            ));
        }
        match message {
            Message::StartAck(_) => Ok(()),
            Message::EndAck(ack) => {
                self.check_ranges("acknowledged", &ack.acknowledged)?;
                self.check_ranges("rejected", &ack.rejected)
            }
            Message::ReqRet(req) => self.check_ranges("requested", &req.ranges),
            Message::Start(_) | Message::Data(_) | Message::End(_) => {
                Err("agent frame received as response".to_string())
            }
        }
    }

    fn check_ranges(&self, field: &str, ranges: &[SeqRange]) -> Result<(), String> {
        for range in ranges {
            if !range.is_valid() {
                return Err(format!(
                    "{field} range {}..={} is inverted",
                    range.begin, range.end
                ));
            }
            // every seq in the range was streamed; `0..=u64::MAX` has no u64 width
            let streamed = self.seqs.range(range.begin..=range.end).count() as u64;
            if streamed.checked_sub(1) != Some(range.end - range.begin) {
                return Err(format!(
                    "{field} range {}..={} names seqs not streamed in this round",
                    range.begin, range.end
                ));
            }
        }
        Ok(())
    }

    /// Queues a response and wakes the round.
    pub(crate) fn deliver(&self, message: Message) {
        self.inbox.lock().push_back(message);
        self.signal.notify_one();
    }

    /// Takes the next response, waiting at most `timeout`.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(message) = inbox.pop_front() {
                return Some(message);
            }
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut inbox, deadline).timed_out() {
                        return inbox.pop_front();
                    }
                }
                None => self.signal.wait(&mut inbox),
            }
        }
    }
}
