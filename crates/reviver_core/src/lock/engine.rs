//! Lockers backed by the storage engine's own file locks.
//!
//! Each locker keeps a private connection to the database. The read
//! locker opens a deferred transaction and reads the schema, which pins a
//! WAL snapshot so no checkpoint can overwrite pages still being read.
//! The write locker takes the engine's reserved lock with
//! `BEGIN IMMEDIATE`.

use crate::error::{CoreError, CoreResult};
use crate::lock::locker::Locker;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
struct EngineLock {
    path: PathBuf,
    timeout: Duration,
    connection: Option<Connection>,
    held: bool,
}

impl EngineLock {
    fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            connection: None,
            held: false,
        }
    }

    fn connection(&mut self) -> CoreResult<&Connection> {
        if self.connection.is_none() {
            let connection = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            connection.busy_timeout(self.timeout)?;
            self.connection = Some(connection);
        }
        self.connection
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("lock connection is not open"))
    }

    fn acquire(&mut self, begin: &str, mode: &'static str) -> CoreResult<()> {
        if self.held {
            return Ok(());
        }
        let begun = self.connection()?.execute_batch(begin);
        begun.map_err(|error| lock_error(error, &self.path, mode))?;
        self.held = true;
        debug!(path = %self.path.display(), mode, "engine lock taken");
        Ok(())
    }

    fn release(&mut self) -> CoreResult<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        if let Some(connection) = self.connection.as_ref() {
            if !connection.is_autocommit() {
                connection.execute_batch("ROLLBACK")?;
            }
        }
        Ok(())
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(path = %self.path.display(), error = %error, "releasing engine lock failed");
        }
    }
}

fn lock_error(error: rusqlite::Error, path: &Path, mode: &'static str) -> CoreError {
    match error.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
            CoreError::lock_timeout(path, mode)
        }
        _ => CoreError::Engine(error),
    }
}

/// Read lock pinning the current snapshot through a deferred transaction.
#[derive(Debug)]
pub struct HandleReadLocker {
    lock: EngineLock,
}

impl HandleReadLocker {
    /// Creates a released locker for `path`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            lock: EngineLock::new(path.into(), timeout),
        }
    }
}

impl Locker for HandleReadLocker {
    fn acquire(&mut self) -> CoreResult<()> {
        self.lock.acquire("BEGIN", "read")?;
        let pinned = self.lock.connection().and_then(|connection| {
            connection
                .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
                .map_err(CoreError::from)
        });
        if let Err(error) = pinned {
            let _ = self.lock.release();
            return Err(error);
        }
        Ok(())
    }

    fn release(&mut self) -> CoreResult<()> {
        self.lock.release()
    }

    fn is_held(&self) -> bool {
        self.lock.held
    }
}

/// Write lock holding the engine's reserved lock.
#[derive(Debug)]
pub struct HandleWriteLocker {
    lock: EngineLock,
}

impl HandleWriteLocker {
    /// Creates a released locker for `path`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            lock: EngineLock::new(path.into(), timeout),
        }
    }
}

impl Locker for HandleWriteLocker {
    fn acquire(&mut self) -> CoreResult<()> {
        self.lock.acquire("BEGIN IMMEDIATE", "write")
    }

    fn release(&mut self) -> CoreResult<()> {
        self.lock.release()
    }

    fn is_held(&self) -> bool {
        self.lock.held
    }
}
