//! In-process reader/writer exclusion per database path.

use crate::error::{CoreError, CoreResult};
use crate::lock::locker::Locker;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
struct PathLockState {
    readers: usize,
    writer: bool,
}

/// Reader/writer counts per path, shared by every locker of a core.
///
/// Any number of readers or a single writer may hold a path.
#[derive(Debug, Default)]
pub struct PathLockRegistry {
    states: Mutex<HashMap<PathBuf, PathLockState>>,
    changed: Condvar,
}

impl PathLockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_for(
        &self,
        path: &Path,
        timeout: Duration,
        mode: &'static str,
        admits: impl Fn(&PathLockState) -> bool,
        take: impl FnOnce(&mut PathLockState),
    ) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut states = self.states.lock();
        loop {
            let state = states.entry(path.to_path_buf()).or_default();
            if admits(state) {
                take(state);
                trace!(path = %path.display(), mode, "process lock taken");
                return Ok(());
            }
            if self.changed.wait_until(&mut states, deadline).timed_out() {
                let state = states.entry(path.to_path_buf()).or_default();
                if admits(state) {
                    take(state);
                    return Ok(());
                }
                return Err(CoreError::lock_timeout(path, mode));
            }
        }
    }

    fn update(&self, path: &Path, change: impl FnOnce(&mut PathLockState)) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(path) {
            change(state);
            if state.readers == 0 && !state.writer {
                states.remove(path);
            }
        }
        drop(states);
        self.changed.notify_all();
    }

    /// Takes a shared lock on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if a writer holds the path past
    /// `timeout`.
    pub fn lock_read(&self, path: &Path, timeout: Duration) -> CoreResult<()> {
        self.wait_for(path, timeout, "read", |s| !s.writer, |s| s.readers += 1)
    }

    /// Takes the exclusive lock on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if readers or a writer hold the
    /// path past `timeout`.
    pub fn lock_write(&self, path: &Path, timeout: Duration) -> CoreResult<()> {
        self.wait_for(
            path,
            timeout,
            "write",
            |s| !s.writer && s.readers == 0,
            |s| s.writer = true,
        )
    }

    /// Drops one shared lock on `path`.
    pub fn unlock_read(&self, path: &Path) {
        self.update(path, |s| s.readers = s.readers.saturating_sub(1));
    }

    /// Drops the exclusive lock on `path`.
    pub fn unlock_write(&self, path: &Path) {
        self.update(path, |s| s.writer = false);
    }

    /// Returns the number of shared holders of `path`.
    #[must_use]
    pub fn readers(&self, path: &Path) -> usize {
        self.states.lock().get(path).map_or(0, |s| s.readers)
    }

    /// Returns true if `path` is held exclusively.
    #[must_use]
    pub fn is_write_locked(&self, path: &Path) -> bool {
        self.states.lock().get(path).is_some_and(|s| s.writer)
    }
}

/// Shared process lock on one path.
#[derive(Debug)]
pub struct ProcessReadLocker {
    registry: Arc<PathLockRegistry>,
    path: PathBuf,
    timeout: Duration,
    held: bool,
}

impl ProcessReadLocker {
    /// Creates a released locker.
    pub fn new(registry: Arc<PathLockRegistry>, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            registry,
            path: path.into(),
            timeout,
            held: false,
        }
    }
}

impl Locker for ProcessReadLocker {
    fn acquire(&mut self) -> CoreResult<()> {
        if !self.held {
            self.registry.lock_read(&self.path, self.timeout)?;
            self.held = true;
        }
        Ok(())
    }

    fn release(&mut self) -> CoreResult<()> {
        if self.held {
            self.held = false;
            self.registry.unlock_read(&self.path);
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for ProcessReadLocker {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Exclusive process lock on one path.
#[derive(Debug)]
pub struct ProcessWriteLocker {
    registry: Arc<PathLockRegistry>,
    path: PathBuf,
    timeout: Duration,
    held: bool,
}

impl ProcessWriteLocker {
    /// Creates a released locker.
    pub fn new(registry: Arc<PathLockRegistry>, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            registry,
            path: path.into(),
            timeout,
            held: false,
        }
    }
}

impl Locker for ProcessWriteLocker {
    fn acquire(&mut self) -> CoreResult<()> {
        if !self.held {
            self.registry.lock_write(&self.path, self.timeout)?;
            self.held = true;
        }
        Ok(())
    }

    fn release(&mut self) -> CoreResult<()> {
        if self.held {
            self.held = false;
            self.registry.unlock_write(&self.path);
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for ProcessWriteLocker {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn readers_share_writer_excludes() {
        let registry = Arc::new(PathLockRegistry::new());
        let path = Path::new("/db/a.db");

        let mut first = ProcessReadLocker::new(Arc::clone(&registry), path, SHORT);
        let mut second = ProcessReadLocker::new(Arc::clone(&registry), path, SHORT);
        first.acquire().unwrap();
        second.acquire().unwrap();
        assert_eq!(registry.readers(path), 2);

        let mut writer = ProcessWriteLocker::new(Arc::clone(&registry), path, SHORT);
        assert_eq!(writer.acquire().unwrap_err().kind(), ErrorKind::Lock);
        assert!(!writer.is_held());

        first.release().unwrap();
        second.release().unwrap();
        writer.acquire().unwrap();
        assert!(registry.is_write_locked(path));
        assert!(first.acquire().is_err());
    }

    #[test]
    fn other_paths_are_independent() {
        let registry = Arc::new(PathLockRegistry::new());
        let mut a = ProcessWriteLocker::new(Arc::clone(&registry), "/db/a.db", SHORT);
        let mut b = ProcessWriteLocker::new(Arc::clone(&registry), "/db/b.db", SHORT);
        a.acquire().unwrap();
        b.acquire().unwrap();
    }

    #[test]
    fn waiting_writer_wakes_on_release() {
        let registry = Arc::new(PathLockRegistry::new());
        let mut reader = ProcessReadLocker::new(Arc::clone(&registry), "/db/a.db", SHORT);
        reader.acquire().unwrap();

        let waiting = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut writer =
                    ProcessWriteLocker::new(registry, "/db/a.db", Duration::from_secs(5));
                writer.acquire().map(|()| writer.is_held())
            })
        };
        thread::sleep(Duration::from_millis(10));
        drop(reader);
        assert!(waiting.join().unwrap().unwrap());
    }
}
