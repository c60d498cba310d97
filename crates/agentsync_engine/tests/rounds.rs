//! End-to-end synchronization rounds.

use agentsync_engine::{
    LoopbackOptions, LoopbackServer, MockTransport, ProtocolEngine, RetryConfig, SyncConfig,
    SyncError, SyncState,
};
use agentsync_protocol::{EndAck, Message, MessageType, Mode, Operation, SeqRange, Status};
use agentsync_queue::PersistentQueue;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const FIVE_SECONDS: Duration = Duration::from_secs(5);

fn config() -> SyncConfig {
    SyncConfig::new().with_retry(RetryConfig::immediate())
}

fn memory_queue() -> Arc<PersistentQueue> {
    Arc::new(PersistentQueue::open(":memory:").unwrap())
}

fn with_loopback(
    queue: Arc<PersistentQueue>,
    options: LoopbackOptions,
) -> (Arc<ProtocolEngine>, Arc<LoopbackServer>) {
    let manager = Arc::new(LoopbackServer::with_options(options));
    let engine = Arc::new(ProtocolEngine::new(queue, Arc::clone(&manager), config()));
    let weak: Weak<ProtocolEngine> = Arc::downgrade(&engine);
    manager.set_responder(move |buffer| {
        if let Some(engine) = weak.upgrade() {
            let _ = engine.parse_response_buffer(buffer);
        }
    });
    (engine, manager)
}

fn with_mock() -> (Arc<ProtocolEngine>, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    let engine = Arc::new(ProtocolEngine::new(memory_queue(), Arc::clone(&mock), config()));
    (engine, mock)
}

fn fill(engine: &ProtocolEngine, module: &str, count: usize) {
    for i in 0..count {
        engine
            .persist_difference(module, &format!("id-{i}"), Operation::Upsert, "fim_file", "{}")
            .unwrap();
    }
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + FIVE_SECONDS;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn started_session(mock: &MockTransport) -> u64 {
    mock.sent_messages()
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::Start(start) => Some(start.session),
            _ => None,
        })
        .unwrap()
}

fn end_ack(session: u64, acknowledged: Vec<SeqRange>) -> Vec<u8> {
    Message::EndAck(EndAck {
        status: Status::Ok,
        session,
        module: "FIM".into(),
        acknowledged,
        rejected: vec![],
    })
    .encode()
    .unwrap()
}

#[test]
fn acknowledged_diff_leaves_the_queue() {
    let (engine, mock) = with_mock();
    let seq = engine
        .persist_difference("FIM", "a", Operation::Upsert, "FIM", r#"{"v":1}"#)
        .unwrap();
    assert_eq!(seq, 1);

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.module("FIM").synchronize_module(Mode::Delta, FIVE_SECONDS, 2, 0))
    };

    wait_for("End", || mock.count(MessageType::End) == 1);
    let session = started_session(&mock);
    assert!(engine.module("FIM").parse_response_buffer(&end_ack(session, vec![SeqRange::single(1)])));

    assert!(round.join().unwrap());
    assert!(engine.queue().fetch_all("FIM").unwrap().is_empty());

    let types: Vec<MessageType> = mock.sent_messages().iter().map(Message::message_type).collect();
    assert_eq!(types, vec![MessageType::Start, MessageType::Data, MessageType::End]);
    match &mock.sent_messages()[1] {
        Message::Data(data) => {
            assert_eq!((data.seq, data.id.as_str(), data.index.as_str()), (1, "a", "FIM"));
            assert_eq!(data.operation, Operation::Upsert);
            assert_eq!(data.data, r#"{"v":1}"#);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(mock.sent().iter().all(|frame| frame.location == "FIM"));
}

#[test]
fn data_frames_respect_the_ceiling() {
    let (engine, manager) = with_loopback(memory_queue(), LoopbackOptions::new());
    fill(&engine, "FIM", 12);

    let report = engine
        .synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 2, 5)
        .unwrap();
    assert_eq!(report.streamed, 12);
    assert_eq!(report.acknowledged, 12);

    let times = manager.data_times();
    assert_eq!(times.len(), 12);
    for i in 0..times.len() - 5 {
        let spread = times[i + 5].duration_since(times[i]);
        assert!(spread >= Duration::from_millis(950), "window at {i} spans {spread:?}");
    }
}

#[test]
fn start_retries_are_exhausted_without_data() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 3);
    mock.fail_type(MessageType::Start);

    let ok = engine
        .module("FIM")
        .synchronize_module(Mode::Delta, Duration::from_secs(1), 3, 0);

    assert!(!ok);
    assert_eq!(mock.attempts(), vec![MessageType::Start; 3]);
    assert_eq!(mock.count(MessageType::Data), 0);
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 3);
    assert_eq!(engine.stats().send_retries, 2);
    assert_eq!(engine.state("FIM"), SyncState::Failed);
}

#[test]
fn data_failure_aborts_before_end() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 3);
    mock.fail_when(|m| matches!(m, Message::Data(d) if d.seq == 2));

    let err = engine
        .synchronize_module("FIM", Mode::Delta, Duration::from_secs(1), 3, 0)
        .unwrap_err();

    assert!(matches!(err, SyncError::Transport { .. }));
    assert_eq!(mock.count(MessageType::End), 0);
    assert_eq!(mock.count(MessageType::Data), 1);
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 3);
}

#[test]
fn one_round_per_module_while_others_run() {
    let options = LoopbackOptions::new().with_ack_delay(Duration::from_millis(300));
    let (engine, _manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 2);
    fill(&engine, "syscollector", 2);

    let first = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0))
    };
    wait_for("FIM round", || engine.queue().is_claimed("FIM"));

    let second = engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0);
    assert!(matches!(second, Err(SyncError::RoundInProgress { .. })));

    let other = engine
        .synchronize_module("syscollector", Mode::Delta, FIVE_SECONDS, 1, 0)
        .unwrap();
    assert_eq!(other.acknowledged, 2);

    let first = first.join().unwrap().unwrap();
    assert_eq!(first.acknowledged, 2);
    assert_eq!(engine.stats().rounds_completed, 2);
    assert!(!engine.queue().is_claimed("FIM"));
}

#[test]
fn lost_frame_is_retransmitted_once() {
    let options = LoopbackOptions::new().with_dropped([2]);
    let (engine, manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 3);

    let report = engine
        .synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 2, 0)
        .unwrap();

    assert_eq!(report.streamed, 3);
    assert_eq!(report.retransmitted, 1);
    assert_eq!(report.end_resends, 1);
    assert_eq!(report.acknowledged, 3);
    // Start, three Data, End, the resent Data, End again
    assert_eq!(manager.frames_received(), 7);
    assert_eq!(engine.stats().data_frames_retransmitted, 1);
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 0);
}

#[test]
fn foreign_responses_leave_the_round_waiting() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 2);

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0))
    };
    wait_for("End", || mock.count(MessageType::End) == 1);
    let session = started_session(&mock);

    let foreign = engine.parse_response_buffer(&end_ack(session ^ 1, vec![SeqRange::single(1)]));
    assert!(matches!(foreign, Err(SyncError::ResponseMismatch { .. })));

    let unknown = engine.parse_response_buffer(&end_ack(session, vec![SeqRange::new(1, 9)]));
    assert!(matches!(unknown, Err(SyncError::ResponseMismatch { .. })));

    let truncated = end_ack(session, vec![SeqRange::new(1, 2)]);
    assert!(engine
        .parse_response_buffer(&truncated[..truncated.len() - 1])
        .unwrap_err()
        .is_decode_failure());

    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 2);
    assert_eq!(engine.state("FIM"), SyncState::AwaitingAck);

    engine
        .parse_response_buffer(&end_ack(session, vec![SeqRange::new(1, 2)]))
        .unwrap();
    let report = round.join().unwrap().unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(engine.stats().responses_discarded, 3);
}

#[test]
fn whole_seq_space_ack_is_a_mismatch() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 1);

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0))
    };
    wait_for("End", || mock.count(MessageType::End) == 1);
    let session = started_session(&mock);

    for range in [SeqRange::new(0, u64::MAX), SeqRange::new(1, u64::MAX)] {
        let result = engine.parse_response_buffer(&end_ack(session, vec![range]));
        assert!(matches!(result, Err(SyncError::ResponseMismatch { .. })));
    }
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 1);

    engine
        .parse_response_buffer(&end_ack(session, vec![SeqRange::single(1)]))
        .unwrap();
    let report = round.join().unwrap().unwrap();
    assert_eq!(report.acknowledged, 1);
}

#[test]
fn noisy_manager_still_completes() {
    let options = LoopbackOptions::new().with_noise();
    let (engine, _manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 4);

    let report = engine
        .synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 2, 0)
        .unwrap();
    assert_eq!(report.acknowledged, 4);
    // junk and a foreign copy ahead of StartAck and EndAck
    assert!(engine.stats().responses_discarded >= 3);
}

#[test]
fn stale_ack_is_accepted_and_dropped() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 1);

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0))
    };
    wait_for("End", || mock.count(MessageType::End) == 1);
    let ack = end_ack(started_session(&mock), vec![SeqRange::single(1)]);
    engine.parse_response_buffer(&ack).unwrap();
    round.join().unwrap().unwrap();

    fill(&engine, "FIM", 1);
    assert!(engine.parse_response_buffer(&ack).is_ok());
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 1);
    assert_eq!(engine.stats().responses_discarded, 1);
}

#[test]
fn end_status_error_removes_nothing() {
    let options = LoopbackOptions::new().with_failed_end();
    let (engine, _manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 3);

    let err = engine
        .synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 2, 0)
        .unwrap_err();

    assert!(matches!(err, SyncError::Rejected { stage: "end", .. }));
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 3);
}

#[test]
fn silent_manager_times_out_and_keeps_rows() {
    let options = LoopbackOptions::new().silent();
    let (engine, manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 2);

    let started = Instant::now();
    let err = engine
        .synchronize_module("FIM", Mode::Delta, Duration::from_millis(50), 2, 0)
        .unwrap_err();

    assert!(matches!(err, SyncError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < FIVE_SECONDS);
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 2);
    assert_eq!(engine.state("FIM"), SyncState::Failed);

    manager.set_options(LoopbackOptions::new());
    let report = engine
        .synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 2, 0)
        .unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(engine.state("FIM"), SyncState::Completed);
}

#[test]
fn rows_persisted_mid_round_wait_for_the_next_round() {
    let options = LoopbackOptions::new().with_ack_delay(Duration::from_millis(200));
    let (engine, _manager) = with_loopback(memory_queue(), options);
    fill(&engine, "FIM", 2);

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Delta, FIVE_SECONDS, 1, 0))
    };
    wait_for("FIM round", || engine.state("FIM") == SyncState::AwaitingAck);
    engine
        .persist_difference("FIM", "late", Operation::Delete, "fim_file", "")
        .unwrap();

    assert_eq!(round.join().unwrap().unwrap().acknowledged, 2);
    let rest = engine.queue().fetch_all("FIM").unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, "late");
}

#[test]
fn full_resync_after_reset_announces_nothing() {
    let (engine, mock) = with_mock();
    fill(&engine, "FIM", 3);
    assert!(engine.module("FIM").reset());

    let round = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.synchronize_module("FIM", Mode::Full, FIVE_SECONDS, 1, 0))
    };
    wait_for("End", || mock.count(MessageType::End) == 1);
    engine
        .parse_response_buffer(&end_ack(started_session(&mock), vec![]))
        .unwrap();
    round.join().unwrap().unwrap();

    match &mock.sent_messages()[0] {
        Message::Start(start) => {
            assert_eq!(start.mode, Mode::Full);
            assert_eq!(start.size, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(mock.count(MessageType::Data), 0);
}

#[test]
fn failed_round_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agent_modules_state.db");
    let path = path.to_str().unwrap();

    {
        let queue = Arc::new(PersistentQueue::open(path).unwrap());
        let (engine, _manager) = with_loopback(queue, LoopbackOptions::new().silent());
        fill(&engine, "FIM", 3);
        assert!(!engine
            .module("FIM")
            .synchronize_module(Mode::Delta, Duration::from_millis(20), 1, 0));
    }

    let queue = Arc::new(PersistentQueue::open(path).unwrap());
    let (engine, _manager) = with_loopback(queue, LoopbackOptions::new());
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 3);
    assert!(engine
        .module("FIM")
        .synchronize_module(Mode::Delta, FIVE_SECONDS, 1, 0));
    assert_eq!(engine.queue().pending_count("FIM").unwrap(), 0);
}
