//! # agentsync engine
//!
//! Synchronization rounds between an agent's pending diffs and a manager.
//!
//! This crate provides:
//! - The round state machine (`Start → Data* → End → ack`)
//! - Response handoff from the receive path to the blocked round
//! - Throughput ceiling for Data frames
//! - Retry with exponential backoff for Start and End
//! - Message-queue transport and an in-process loopback manager
//!
//! ## Round model
//!
//! 1. Claim the module; a second round for it is refused
//! 2. Snapshot the pending rows and announce them with `Start`
//! 3. Stream one `Data` frame per row in ascending seq, then `End`
//! 4. Wait for `EndAck`, serving `ReqRet` retransmission requests meanwhile
//! 5. Remove exactly the acknowledged seqs from the queue
//!
//! ## Key Invariants
//!
//! - A row leaves the queue only when an acknowledgment for the round that
//!   streamed it names its seq
//! - A failed round leaves the queue as it found it
//! - Malformed or foreign responses change nothing
//!
//! ## Example
//!
//! ```rust
//! use agentsync_engine::{LoopbackServer, ProtocolEngine, SyncConfig};
//! use agentsync_protocol::{Mode, Operation};
//! use agentsync_queue::PersistentQueue;
//! use std::sync::{Arc, Weak};
//! use std::time::Duration;
//!
//! let queue = Arc::new(PersistentQueue::open(":memory:").unwrap());
//! let manager = Arc::new(LoopbackServer::new());
//! let engine = Arc::new(ProtocolEngine::new(queue, Arc::clone(&manager), SyncConfig::default()));
//!
//! let weak: Weak<ProtocolEngine> = Arc::downgrade(&engine);
//! manager.set_responder(move |buffer| {
//!     if let Some(engine) = weak.upgrade() {
//!         let _ = engine.parse_response_buffer(buffer);
//!     }
//! });
//!
//! let fim = engine.module("FIM");
//! fim.persist_difference("a", Operation::Upsert, "fim_file", r#"{"v":1}"#);
//! assert!(fim.synchronize_module(Mode::Delta, Duration::from_secs(5), 2, 0));
//! assert_eq!(engine.queue().pending_count("FIM").unwrap(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod handle;
mod loopback;
mod round;
mod state;
mod throttle;
mod transport;

pub use config::{QueueBinding, RetryConfig, SyncConfig};
pub use engine::ProtocolEngine;
pub use error::{SyncError, SyncResult};
pub use handle::AgentSyncProtocol;
pub use loopback::{LoopbackOptions, LoopbackServer, Responder};
pub use state::{RoundReport, SyncState, SyncStats};
pub use throttle::EpsLimiter;
pub use transport::{MessageQueue, MockTransport, MqTransport, SentFrame, Transport};
