//! Error types for Reviver core.

use rusqlite::ErrorCode;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
///
/// Repair and backup results report this kind so callers can decide
/// whether to retry (`Lock`), accept a partial recovery (`Corruption`) or
/// give up (`Io`, `Cipher`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Short read/write, permission, missing file.
    Io,
    /// Bad magic, page size or header.
    Format,
    /// Checksum mismatch, cycle detected, truncated cell.
    Corruption,
    /// A read or write lock could not be acquired within policy.
    Lock,
    /// Handle configuration or reconfiguration failed.
    Config,
    /// Wrong key or undecryptable data.
    Cipher,
    /// The storage engine rejected a statement.
    Engine,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// API misuse.
    InvalidOperation,
}

/// Errors that can occur in Reviver core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] reviver_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage engine error.
    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    /// Invalid file format (header, magic, page size).
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Page, frame or cell level corruption.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A lock was not granted before the timeout.
    #[error("timed out acquiring {mode} lock on {path:?}")]
    LockTimeout {
        /// The locked path.
        path: PathBuf,
        /// `read` or `write`.
        mode: &'static str,
    },

    /// A lock could not be acquired because it conflicts with another holder.
    #[error("lock conflict: {message}")]
    LockConflict {
        /// Description of the conflict.
        message: String,
    },

    /// Handle configuration failed.
    #[error("config {name} failed: {message}")]
    Config {
        /// Name of the failing config.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Encryption or decryption failed.
    #[error("cipher error: {message}")]
    Cipher {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// All handle slots of a pool are checked out.
    #[error("handle pool for {path:?} exhausted ({max} handles)")]
    PoolExhausted {
        /// Database path.
        path: PathBuf,
        /// Configured maximum.
        max: usize,
    },

    /// The pool was closed.
    #[error("handle pool for {path:?} is closed")]
    PoolClosed {
        /// Database path.
        path: PathBuf,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The caller cancelled the session.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(path: impl Into<PathBuf>, mode: &'static str) -> Self {
        Self::LockTimeout {
            path: path.into(),
            mode,
        }
    }

    /// Creates a lock conflict error.
    pub fn lock_conflict(message: impl Into<String>) -> Self {
        Self::LockConflict {
            message: message.into(),
        }
    }

    /// Creates a config error.
    pub fn config(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a cipher error.
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(reviver_storage::StorageError::ReadOnly) => ErrorKind::InvalidOperation,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Io,
            Self::Engine(e) => match e.sqlite_error_code() {
                Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => ErrorKind::Corruption,
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ErrorKind::Lock,
                Some(
                    ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::PermissionDenied
                    | ErrorCode::DiskFull,
                ) => ErrorKind::Io,
                _ => ErrorKind::Engine,
            },
            Self::InvalidFormat { .. } => ErrorKind::Format,
            Self::Corruption { .. } | Self::ChecksumMismatch { .. } => ErrorKind::Corruption,
            Self::LockTimeout { .. } | Self::LockConflict { .. } => ErrorKind::Lock,
            Self::Config { .. } => ErrorKind::Config,
            Self::Cipher { .. } | Self::InvalidKeySize { .. } => ErrorKind::Cipher,
            Self::MigrationFailed { .. } => ErrorKind::Engine,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::PoolExhausted { .. } | Self::PoolClosed { .. } | Self::InvalidOperation { .. } => {
                ErrorKind::InvalidOperation
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CoreError::invalid_format("magic").kind(), ErrorKind::Format);
        assert_eq!(CoreError::corruption("cycle").kind(), ErrorKind::Corruption);
        assert_eq!(
            CoreError::ChecksumMismatch { expected: 1, actual: 2 }.kind(),
            ErrorKind::Corruption
        );
        assert_eq!(CoreError::lock_timeout("/a.db", "read").kind(), ErrorKind::Lock);
        assert_eq!(CoreError::config("journal", "busy").kind(), ErrorKind::Config);
        assert_eq!(CoreError::invalid_key_size(3, 32).kind(), ErrorKind::Cipher);
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CoreError::from(io::Error::new(io::ErrorKind::PermissionDenied, "no")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn engine_errors_are_classified_by_code() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: CoreError = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Engine);

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(CoreError::from(busy).kind(), ErrorKind::Lock);

        let corrupt = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        );
        assert_eq!(CoreError::from(corrupt).kind(), ErrorKind::Corruption);
    }

    #[test]
    fn display_includes_detail() {
        let err = CoreError::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0x0102_0304,
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected deadbeef, got 01020304");
    }
}
