//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Fault to apply to the next append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Refuse the write without touching the data.
    Refuse,
    /// Write only the first `n` bytes, then fail.
    Tear(usize),
}

/// An in-memory storage backend.
///
/// Backs `":memory:"` stores and tests. Clones share the same bytes, so a
/// test can drop a store and "reopen" it from a clone of its backend.
///
/// Writes can be made to fail on demand to exercise the journal's
/// rollback path.
///
/// # Example
///
/// ```rust
/// use agentsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let reopened = backend.clone();
/// backend.append(b"abc").unwrap();
/// assert_eq!(reopened.size().unwrap(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding pre-existing bytes.
    ///
    /// Useful for recovery tests that hand-craft damaged journals.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            faults: Arc::default(),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes the next append fail without writing anything.
    pub fn fail_next_append(&self) {
        self.faults.lock().push(Fault::Refuse);
    }

    /// Makes the next append write only `keep` bytes before failing,
    /// leaving a torn record behind.
    pub fn tear_next_append(&self, keep: usize) {
        self.faults.lock().push(Fault::Tear(keep));
    }

    fn take_fault(&self) -> Option<Fault> {
        let mut faults = self.faults.lock();
        if faults.is_empty() {
            None
        } else {
            Some(faults.remove(0))
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let fault = self.take_fault();
        let mut data = self.data.write();
        let offset = data.len() as u64;

        match fault {
            None => {
                data.extend_from_slice(bytes);
                Ok(offset)
            }
            Some(Fault::Refuse) => Err(StorageError::WriteRefused("injected fault".into())),
            Some(Fault::Tear(keep)) => {
                data.extend_from_slice(&bytes[..keep.min(bytes.len())]);
                Err(StorageError::WriteRefused(format!(
                    "torn write after {keep} bytes"
                )))
            }
        }
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn clones_share_bytes() {
        let mut backend = InMemoryBackend::new();
        let other = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(other.data(), b"shared");
    }

    #[test]
    fn refused_append_leaves_data_untouched() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"keep").unwrap();
        backend.fail_next_append();

        assert!(backend.append(b"lost").is_err());
        assert_eq!(backend.data(), b"keep");

        // Only one append is affected.
        backend.append(b"!").unwrap();
        assert_eq!(backend.data(), b"keep!");
    }

    #[test]
    fn torn_append_leaves_prefix() {
        let mut backend = InMemoryBackend::new();
        backend.tear_next_append(2);

        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(backend.data(), b"ab");
    }

    #[test]
    fn truncate_and_replace() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(matches!(
            backend.truncate(50),
            Err(StorageError::InvalidTruncate { .. })
        ));

        backend.replace(b"fresh").unwrap();
        assert_eq!(backend.data(), b"fresh");
    }
}
