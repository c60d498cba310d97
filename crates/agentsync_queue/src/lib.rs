//! # agentsync queue
//!
//! Durable per-module queue of pending diffs.
//!
//! This crate provides:
//! - [`PersistedDiff`], one pending change
//! - the [`DiffStorage`] contract and [`JournalStorage`], its implementation
//!   over an append-only journal on any [`agentsync_storage::StorageBackend`]
//! - [`PersistentQueue`], the thread-safe façade shared by every module
//!   engine in a process, with per-module round claims
//!
//! ## Guarantees
//!
//! - a row is fully present or fully absent, even across crashes
//! - seqs are never reused within a module, across removal, compaction and
//!   restarts
//! - `(module, id)` and `(module, seq)` are unique among pending rows

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compaction;
mod config;
mod error;
pub mod journal;
mod queue;
mod storage;
mod types;

pub use compaction::CompactionResult;
pub use config::StorageConfig;
pub use error::{QueueError, QueueResult};
pub use queue::{ModuleClaim, PersistentQueue, MEMORY_PATH};
pub use storage::{DiffStorage, JournalStorage};
pub use types::PersistedDiff;
