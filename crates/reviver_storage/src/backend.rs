//! Storage backend trait definition.

use crate::error::StorageResult;

/// A positioned byte store.
///
/// Backends do not understand database pages, WAL frames or SHM headers.
/// Callers address bytes by absolute offset.
///
/// # Invariants
///
/// - `read_at` returns exactly `len` bytes or fails
/// - `read_up_to` never fails because the range runs past the end
/// - `write_at` past the end extends the store, zero-filling any gap
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For real files
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends
    /// beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads at most `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes (possibly none) when the store ends early.
    ///
    /// # Errors
    ///
    /// Returns an error only if an I/O error occurs.
    fn read_up_to(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadOnly`] for read-only backends, or
    /// an I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is read-only, `new_size` is greater
    /// than the current size, or the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
