//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The backend was opened read-only.
    #[error("storage is read-only")]
    ReadOnly,

    /// The file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Returns true if this error is a short read rather than an OS failure.
    #[must_use]
    pub fn is_short_read(&self) -> bool {
        matches!(self, Self::ReadPastEnd { .. })
            || matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
