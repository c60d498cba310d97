//! In-process manager for tests and simulations.

use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use agentsync_protocol::{compress_seqs, EndAck, Message, ReqRet, StartAck, Status};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Callback receiving every response the loopback manager emits.
pub type Responder = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// How the loopback manager behaves.
#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    /// Answer Start with an error status.
    pub fail_start: bool,
    /// Answer End with an error status.
    pub fail_end: bool,
    /// Never answer anything.
    pub silent: bool,
    /// Seqs whose first Data frame is lost; a retransmission request follows.
    pub drop_once: BTreeSet<u64>,
    /// Seqs reported as rejected in the acknowledgment.
    pub reject: BTreeSet<u64>,
    /// Delay before each response is delivered.
    pub ack_delay: Duration,
    /// Precede every response with a malformed buffer and a copy carrying a
    /// foreign session.
    pub noise: bool,
}

impl LoopbackOptions {
    /// Creates the default behaviour: accept and acknowledge everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers Start with an error status.
    pub fn with_failed_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Answers End with an error status.
    pub fn with_failed_end(mut self) -> Self {
        self.fail_end = true;
        self
    }

    /// Never answers.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Loses the first Data frame of each given seq.
    pub fn with_dropped(mut self, seqs: impl IntoIterator<Item = u64>) -> Self {
        self.drop_once.extend(seqs);
        self
    }

    /// Rejects the given seqs.
    pub fn with_rejected(mut self, seqs: impl IntoIterator<Item = u64>) -> Self {
        self.reject.extend(seqs);
        self
    }

    /// Delays each response.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Sends junk ahead of every response.
    pub fn with_noise(mut self) -> Self {
        self.noise = true;
        self
    }
}

#[derive(Debug)]
struct Session {
    module: String,
    received: BTreeSet<u64>,
    missing: BTreeSet<u64>,
}

type Outgoing = (Duration, Vec<u8>);

/// A manager simulation speaking the wire protocol.
///
/// Implements [`Transport`], so an engine can send to it directly.
/// Responses are delivered from a background thread to the registered
/// [`Responder`], the way a real receive path calls back into the agent.
/// Until a responder is set, responses are dropped.
///
/// A session that received every seq of the round is acknowledged at End.
/// Lost seqs are requested again with `ReqRet`.
pub struct LoopbackServer {
    options: RwLock<LoopbackOptions>,
    sessions: Mutex<HashMap<u64, Session>>,
    dropped: Mutex<HashSet<(String, u64)>>,
    data_times: Mutex<Vec<Instant>>,
    frames: AtomicUsize,
    outbox: Mutex<Option<mpsc::Sender<Outgoing>>>,
    responder: Arc<RwLock<Option<Responder>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("options", &*self.options.read())
            .field("frames", &self.frames.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer {
    /// Creates a manager that acknowledges everything.
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    /// Creates a manager with the given behaviour.
    pub fn with_options(options: LoopbackOptions) -> Self {
        let (tx, rx) = mpsc::channel::<Outgoing>();
        let responder: Arc<RwLock<Option<Responder>>> = Arc::default();
        let delivery = Arc::clone(&responder);

        let worker = thread::Builder::new()
            .name("loopback-manager".into())
            .spawn(move || {
                for (delay, frame) in rx {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    let callback = delivery.read().clone();
                    match callback {
                        Some(callback) => callback(frame.as_slice()),
                        None => trace!("no responder, response dropped"),
                    }
                }
            })
            .ok();

        Self {
            options: RwLock::new(options),
            sessions: Mutex::new(HashMap::new()),
            dropped: Mutex::new(HashSet::new()),
            data_times: Mutex::new(Vec::new()),
            frames: AtomicUsize::new(0),
            outbox: Mutex::new(worker.as_ref().map(|_| tx)),
            responder,
            worker: Mutex::new(worker),
        }
    }

    /// Registers the callback receiving responses.
    pub fn set_responder(&self, responder: impl Fn(&[u8]) + Send + Sync + 'static) {
        let responder: Responder = Arc::new(responder);
        *self.responder.write() = Some(responder);
    }

    /// Replaces the manager's behaviour for subsequent frames.
    pub fn set_options(&self, options: LoopbackOptions) {
        *self.options.write() = options;
    }

    /// Frames received so far.
    pub fn frames_received(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Arrival times of every Data frame.
    pub fn data_times(&self) -> Vec<Instant> {
        self.data_times.lock().clone()
    }

    /// Sessions opened but not yet acknowledged.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn respond(&self, message: &Message, options: &LoopbackOptions) {
        let Some(outbox) = self.outbox.lock().clone() else {
            return;
        };
        let delay = options.ack_delay;

        if options.noise {
            let _ = outbox.send((delay, b"AS\x01\x05not cbor".to_vec()));
            if let Some(foreign) = with_session(message, message.session().wrapping_add(1).max(1)) {
                if let Ok(frame) = foreign.encode() {
                    let _ = outbox.send((Duration::ZERO, frame));
                }
            }
        }

        match message.encode() {
            Ok(frame) => {
                let delay = if options.noise { Duration::ZERO } else { delay };
                let _ = outbox.send((delay, frame));
            }
            Err(e) => debug!(error = %e, "cannot encode loopback response"),
        }
    }

    fn on_frame(&self, message: Message) {
        let options = self.options.read().clone();
        let mut sessions = self.sessions.lock();

        let response = match message {
            Message::Start(start) => {
                sessions.insert(
                    start.session,
                    Session {
                        module: start.module.clone(),
                        received: BTreeSet::new(),
                        missing: BTreeSet::new(),
                    },
                );
                Some(Message::StartAck(StartAck {
                    status: status(options.fail_start),
                    session: start.session,
                    module: start.module,
                }))
            }
            Message::Data(data) => {
                self.data_times.lock().push(Instant::now());
                if let Some(session) = sessions.get_mut(&data.session) {
                    let lost = options.drop_once.contains(&data.seq)
                        && self.dropped.lock().insert((session.module.clone(), data.seq));
                    if lost {
                        debug!(seq = data.seq, "loopback dropping data frame");
                        session.missing.insert(data.seq);
                    } else {
                        session.missing.remove(&data.seq);
                        session.received.insert(data.seq);
                    }
                }
                None
            }
            Message::End(end) => match sessions.get(&end.session) {
                Some(session) if !session.missing.is_empty() => {
                    Some(Message::ReqRet(ReqRet {
                        session: end.session,
                        module: session.module.clone(),
                        ranges: compress_seqs(session.missing.iter().copied()),
                    }))
                }
                Some(_) => sessions.remove(&end.session).map(|session| {
                    let (rejected, accepted): (Vec<u64>, Vec<u64>) = session
                        .received
                        .iter()
                        .copied()
                        .partition(|seq| options.reject.contains(seq));
                    Message::EndAck(EndAck {
                        status: status(options.fail_end),
                        session: end.session,
                        module: session.module,
                        acknowledged: compress_seqs(accepted),
                        rejected: compress_seqs(rejected),
                    })
                }),
                None => None,
            },
            other => {
                debug!(kind = ?other.message_type(), "loopback ignoring manager frame");
                None
            }
        };
        drop(sessions);

        if let Some(response) = response {
            if !options.silent {
                self.respond(&response, &options);
            }
        }
    }
}

impl Transport for LoopbackServer {
    fn send_binary(&self, _location: &str, payload: &[u8]) -> SyncResult<()> {
        let message = Message::decode(payload)
            .map_err(|e| SyncError::transport_fatal(format!("loopback got a bad frame: {e}")))?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        self.on_frame(message);
        Ok(())
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.outbox.lock().take();
        self.responder.write().take();
        if let Some(worker) = self.worker.lock().take() {
            // the last reference can be released by a responder running on
            // the worker itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn status(error: bool) -> Status {
    if error {
        Status::Error
    } else {
        Status::Ok
    }
}

fn with_session(message: &Message, session: u64) -> Option<Message> {
    let mut copy = message.clone();
    match &mut copy {
        Message::StartAck(ack) => ack.session = session,
        Message::EndAck(ack) => ack.session = session,
        Message::ReqRet(req) => req.session = session,
        _ => return None,
    }
    Some(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentsync_protocol::{Data, End, Mode, Operation, SeqRange, Start};

    fn frame(message: Message) -> Vec<u8> {
        message.encode().unwrap()
    }

    fn start(session: u64) -> Vec<u8> {
        frame(Message::Start(Start {
            session,
            module: "FIM".into(),
            mode: Mode::Delta,
            size: 2,
        }))
    }

    fn data(session: u64, seq: u64) -> Vec<u8> {
        frame(Message::Data(Data {
            session,
            seq,
            id: format!("id-{seq}"),
            index: "fim_file".into(),
            operation: Operation::Upsert,
            data: "{}".into(),
        }))
    }

    fn collect(server: &LoopbackServer) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.set_responder(move |buf| {
            if let Ok(message) = Message::decode(buf) {
                let _ = tx.lock().send(message);
            }
        });
        rx
    }

    fn next(rx: &mpsc::Receiver<Message>) -> Message {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn acknowledges_received_seqs() {
        let server = LoopbackServer::with_options(LoopbackOptions::new().with_rejected([2]));
        let rx = collect(&server);

        server.send_binary("FIM", &start(9)).unwrap();
        server.send_binary("FIM", &data(9, 1)).unwrap();
        server.send_binary("FIM", &data(9, 2)).unwrap();
        server.send_binary("FIM", &frame(Message::End(End { session: 9 }))).unwrap();

        assert!(matches!(next(&rx), Message::StartAck(ack) if ack.status == Status::Ok));
        match next(&rx) {
            Message::EndAck(ack) => {
                assert_eq!(ack.acknowledged, vec![SeqRange::single(1)]);
                assert_eq!(ack.rejected, vec![SeqRange::single(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(server.data_times().len(), 2);
    }

    #[test]
    fn lost_seqs_are_requested_once() {
        let server = LoopbackServer::with_options(LoopbackOptions::new().with_dropped([2]));
        let rx = collect(&server);
        let end = frame(Message::End(End { session: 4 }));

        server.send_binary("FIM", &start(4)).unwrap();
        server.send_binary("FIM", &data(4, 1)).unwrap();
        server.send_binary("FIM", &data(4, 2)).unwrap();
        server.send_binary("FIM", &end).unwrap();

        next(&rx);
        match next(&rx) {
            Message::ReqRet(req) => assert_eq!(req.ranges, vec![SeqRange::single(2)]),
            other => panic!("unexpected {other:?}"),
        }

        server.send_binary("FIM", &data(4, 2)).unwrap();
        server.send_binary("FIM", &end).unwrap();
        match next(&rx) {
            Message::EndAck(ack) => assert_eq!(ack.acknowledged, vec![SeqRange::new(1, 2)]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn silent_manager_never_answers() {
        let server = LoopbackServer::with_options(LoopbackOptions::new().silent());
        let rx = collect(&server);
        server.send_binary("FIM", &start(1)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(server.frames_received(), 1);
    }

    #[test]
    fn rejects_undecodable_frames() {
        let server = LoopbackServer::new();
        let err = server.send_binary("FIM", b"junk").unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(server.frames_received(), 0);
    }
}
