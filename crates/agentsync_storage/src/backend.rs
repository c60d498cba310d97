//! Storage backend trait definition.

use crate::error::StorageResult;

/// A byte store holding an append-only journal.
///
/// The journal layer appends one framed record per mutation and replays the
/// whole store on open. Compaction swaps the entire contents in one step
/// with [`StorageBackend::replace`].
///
/// # Invariants
///
/// - `append` returns the offset where the bytes start
/// - `read_at` returns exactly the bytes previously written at that offset
/// - after `sync` returns, appended bytes survive process termination
/// - `replace` is all-or-nothing: readers observe the old or the new
///   contents, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends bytes to the end of the store and returns their offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Forces appended bytes to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Used to cut a torn tail after a crash and to roll back a failed
    /// append.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole contents with `data`.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the entire store.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "store too large to load")
        })?;
        self.read_at(0, len)
    }
}
