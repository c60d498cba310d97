//! Transport abstraction and message-queue binding.

use crate::config::QueueBinding;
use crate::error::{SyncError, SyncResult};
use agentsync_protocol::{Message, MessageType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Hands encoded frames to whatever carries them to the manager.
///
/// `Ok` means the frame was accepted for transmission, not that it was
/// delivered. Responses come back out-of-band through
/// [`crate::ProtocolEngine::parse_response_buffer`].
pub trait Transport: Send + Sync {
    /// Sends one frame. `location` tags the frame with its module.
    fn send_binary(&self, location: &str, payload: &[u8]) -> SyncResult<()>;
}

/// The local message-queue primitives, as exposed by the host process.
pub trait MessageQueue: Send + Sync {
    /// Opens the queue. Returns the queue id, or a negative value on failure.
    fn start(&self, key: &str, queue_type: i16, attempts: i16) -> i32;

    /// Sends a payload. Returns 0 on success.
    fn send_binary(&self, queue: i32, payload: &[u8], location: &str, location_char: u8) -> i32;
}

/// [`Transport`] over a [`MessageQueue`].
///
/// The queue is opened lazily on the first send and reused afterwards. A
/// failed send drops the queue id so the next send reopens it.
pub struct MqTransport<M: MessageQueue> {
    mq: M,
    binding: QueueBinding,
    queue: Mutex<Option<i32>>,
}

impl<M: MessageQueue> MqTransport<M> {
    /// Creates a transport; nothing is opened yet.
    pub fn new(mq: M, binding: QueueBinding) -> Self {
        Self {
            mq,
            binding,
            queue: Mutex::new(None),
        }
    }

    /// Returns true if a queue id is currently held.
    pub fn is_open(&self) -> bool {
        self.queue.lock().is_some()
    }
}

impl<M: MessageQueue> Transport for MqTransport<M> {
    fn send_binary(&self, location: &str, payload: &[u8]) -> SyncResult<()> {
        let mut queue = self.queue.lock();

        let id = match *queue {
            Some(id) => id,
            None => {
                let binding = &self.binding;
                let id = self
                    .mq
                    .start(&binding.key, binding.queue_type, binding.attempts);
                if id < 0 {
                    warn!(key = %binding.key, status = id, "cannot open message queue");
                    return Err(SyncError::transport_retryable(format!(
                        "cannot open message queue {:?} (status {id})",
                        binding.key
                    )));
                }
                debug!(key = %binding.key, queue = id, "message queue opened");
                *queue = Some(id);
                id
            }
        };

        let status = self
            .mq
            .send_binary(id, payload, location, self.binding.location_char);
        if status != 0 {
            *queue = None;
            return Err(SyncError::transport_retryable(format!(
                "message queue send failed (status {status})"
            )));
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_binary(&self, location: &str, payload: &[u8]) -> SyncResult<()> {
        (**self).send_binary(location, payload)
    }
}

/// A frame recorded by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// When the transport accepted it.
    pub at: Instant,
    /// Location tag.
    pub location: String,
    /// Encoded frame.
    pub payload: Vec<u8>,
}

impl SentFrame {
    /// Decodes the frame.
    pub fn message(&self) -> Option<Message> {
        Message::decode(&self.payload).ok()
    }
}

type FailFilter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Default)]
struct MockState {
    accepted: Vec<SentFrame>,
    attempts: Vec<MessageType>,
    fail_next: usize,
    fail_filter: Option<FailFilter>,
}

/// A recording transport with scripted failures, for tests.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Makes every send of a frame matching `filter` fail.
    pub fn fail_when(&self, filter: impl Fn(&Message) -> bool + Send + Sync + 'static) {
        self.state.lock().fail_filter = Some(Box::new(filter));
    }

    /// Makes every send of the given message type fail.
    pub fn fail_type(&self, message_type: MessageType) {
        self.fail_when(move |message| message.message_type() == message_type);
    }

    /// Stops failing.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_next = 0;
        state.fail_filter = None;
    }

    /// Frames accepted so far.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().accepted.clone()
    }

    /// Decoded frames accepted so far.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent().iter().filter_map(SentFrame::message).collect()
    }

    /// Accepted frames of one type.
    pub fn count(&self, message_type: MessageType) -> usize {
        self.sent_messages()
            .iter()
            .filter(|m| m.message_type() == message_type)
            .count()
    }

    /// Types of every send attempt, accepted or not.
    pub fn attempts(&self) -> Vec<MessageType> {
        self.state.lock().attempts.clone()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("accepted", &state.accepted.len())
            .field("attempts", &state.attempts.len())
            .finish()
    }
}

impl Transport for MockTransport {
    fn send_binary(&self, location: &str, payload: &[u8]) -> SyncResult<()> {
        let at = Instant::now();
        let message = Message::decode(payload).map_err(|e| {
            SyncError::transport_fatal(format!("mock transport got an undecodable frame: {e}"))
        })?;

        let mut state = self.state.lock();
        state.attempts.push(message.message_type());

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::transport_retryable("scripted failure"));
        }
        if state.fail_filter.as_ref().is_some_and(|f| f(&message)) {
            return Err(SyncError::transport_retryable("scripted failure"));
        }

        state.accepted.push(SentFrame {
            at,
            location: location.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}
