//! # agentsync storage
//!
//! Byte-store backends underneath the agentsync diff journal.
//!
//! Backends are **opaque byte stores**: they append, read back, truncate and
//! atomically replace bytes. They know nothing about journal records,
//! modules or the synchronization protocol; `agentsync_queue` owns the
//! record format.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for tests and `":memory:"` stores
//! - [`FileBackend`] - persistent storage with a single-writer process lock
//!
//! ## Example
//!
//! ```rust
//! use agentsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
