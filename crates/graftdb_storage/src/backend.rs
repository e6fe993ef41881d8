//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level append-only byte store.
///
/// Backends do not interpret the bytes they hold; GraftDB owns the
/// journal record format.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at, which equals
///   the store length before the call
/// - `read_at` returns exactly the bytes previously written there
/// - after `sync` returns, all appended data survives process death
pub trait StorageBackend: Send {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] if the range
    /// extends beyond the current length, or on I/O errors.
    fn read_at(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` at the end of the store and returns its offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current length of the store in bytes.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if the store holds no bytes.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Discards all bytes at and after `new_len`.
    ///
    /// # Errors
    ///
    /// Fails if `new_len` exceeds the current length.
    fn truncate(&mut self, new_len: u64) -> StorageResult<()>;
}
