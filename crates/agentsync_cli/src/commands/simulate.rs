//! Simulate command implementation.

use agentsync_engine::{LoopbackOptions, LoopbackServer, ProtocolEngine, RoundReport, SyncConfig};
use agentsync_protocol::{Mode, Operation};
use agentsync_queue::{PersistentQueue, MEMORY_PATH};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Parameters of a simulated round.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Diffs to persist before the round.
    pub items: usize,
    /// Data frames per second, 0 for unthrottled.
    pub max_eps: usize,
    /// Seqs the manager loses once.
    pub drop: Vec<u64>,
    /// Per-attempt acknowledgment timeout.
    pub timeout: Duration,
    /// Attempts for Start and End.
    pub retries: u32,
}

/// Persists `items` diffs in a fresh in-memory queue and synchronizes them
/// with a loopback manager.
pub fn simulate(options: &SimulateOptions) -> Result<(RoundReport, usize), Box<dyn std::error::Error>> {
    let queue = Arc::new(PersistentQueue::open(MEMORY_PATH)?);
    let manager = Arc::new(LoopbackServer::with_options(
        LoopbackOptions::new().with_dropped(options.drop.iter().copied()),
    ));
    let engine = Arc::new(ProtocolEngine::new(queue, Arc::clone(&manager), SyncConfig::default()));

    let weak: Weak<ProtocolEngine> = Arc::downgrade(&engine);
    manager.set_responder(move |buffer| {
        if let Some(engine) = weak.upgrade() {
            let _ = engine.parse_response_buffer(buffer);
        }
    });

    for i in 0..options.items {
        let data = format!(r#"{{"path":"/etc/file{i}","size":{}}}"#, i * 512);
        engine.persist_difference("simulation", &format!("item-{i}"), Operation::Upsert, "fim_file", &data)?;
    }

    let report = engine.synchronize_module(
        "simulation",
        Mode::Delta,
        options.timeout,
        options.retries,
        options.max_eps,
    )?;
    let pending = engine.queue().pending_count("simulation")?;
    Ok((report, pending))
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions) -> Result<(), Box<dyn std::error::Error>> {
    match simulate(options) {
        Ok((report, pending)) => {
            println!("OK");
            println!("  Session:        {:#018x}", report.session);
            println!("  Streamed:       {}", report.streamed);
            println!("  Retransmitted:  {}", report.retransmitted);
            println!("  Acknowledged:   {}", report.acknowledged);
            println!("  Still pending:  {pending}");
            println!("  Duration:       {:?}", report.duration);
            Ok(())
        }
        Err(e) => {
            println!("FAIL: {e}");
            Err("Simulation failed".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_with_lost_frames_completes() {
        let options = SimulateOptions {
            items: 6,
            max_eps: 0,
            drop: vec![2, 5],
            timeout: Duration::from_secs(5),
            retries: 2,
        };

        let (report, pending) = simulate(&options).unwrap();
        assert_eq!(report.streamed, 6);
        assert_eq!(report.retransmitted, 2);
        assert_eq!(report.acknowledged, 6);
        assert_eq!(pending, 0);
    }
}
