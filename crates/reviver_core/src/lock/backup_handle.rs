//! The lock pair used by backup, repair and checkpoint sessions.

use crate::error::CoreResult;
use crate::lock::engine::{HandleReadLocker, HandleWriteLocker};
use crate::lock::locker::{CompositeLocker, Locker};
use crate::lock::process::{PathLockRegistry, ProcessReadLocker, ProcessWriteLocker};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A read locker and a write locker for one database.
///
/// Sessions that read raw pages hold the read lock; checkpoints hold the
/// write lock, so a checkpoint never rewrites pages a session is reading.
pub struct BackupHandle {
    read: Box<dyn Locker>,
    write: Box<dyn Locker>,
}

impl BackupHandle {
    /// Composes a handle from two lock strategies.
    #[must_use]
    pub fn new(read: Box<dyn Locker>, write: Box<dyn Locker>) -> Self {
        Self { read, write }
    }

    /// Builds the standard pair for `path`: the process lock of `registry`
    /// followed by the engine's file lock, for each role.
    #[must_use]
    pub fn for_path(registry: &Arc<PathLockRegistry>, path: &Path, timeout: Duration) -> Self {
        let read = CompositeLocker::new()
            .with(Box::new(ProcessReadLocker::new(Arc::clone(registry), path, timeout)))
            .with(Box::new(HandleReadLocker::new(path, timeout)));
        let write = CompositeLocker::new()
            .with(Box::new(ProcessWriteLocker::new(Arc::clone(registry), path, timeout)))
            .with(Box::new(HandleWriteLocker::new(path, timeout)));
        Self::new(Box::new(read), Box::new(write))
    }

    /// Takes the read lock.
    ///
    /// # Errors
    ///
    /// Returns the read locker's error; nothing stays held.
    pub fn acquire_read_lock(&mut self) -> CoreResult<()> {
        self.read.acquire()
    }

    /// Releases the read lock.
    ///
    /// # Errors
    ///
    /// Returns the read locker's release error.
    pub fn release_read_lock(&mut self) -> CoreResult<()> {
        self.read.release()
    }

    /// Takes the write lock.
    ///
    /// # Errors
    ///
    /// Returns the write locker's error; nothing stays held.
    pub fn acquire_write_lock(&mut self) -> CoreResult<()> {
        self.write.acquire()
    }

    /// Releases the write lock.
    ///
    /// # Errors
    ///
    /// Returns the write locker's release error.
    pub fn release_write_lock(&mut self) -> CoreResult<()> {
        self.write.release()
    }

    /// Returns true while the read lock is held.
    #[must_use]
    pub fn is_read_locked(&self) -> bool {
        self.read.is_held()
    }

    /// Returns true while the write lock is held.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.write.is_held()
    }
}

impl std::fmt::Debug for BackupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupHandle")
            .field("read", &self.read.is_held())
            .field("write", &self.write.is_held())
            .finish()
    }
}
