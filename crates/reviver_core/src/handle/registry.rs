//! Path to pool mapping.
//!
//! The registry is passed explicitly to whoever needs it; there is no
//! process-wide instance. Each path gets one pool, created on first use
//! and closed when the last [`RecyclableDatabase`] for it is dropped.

use crate::error::CoreResult;
use crate::handle::config::Configs;
use crate::handle::pool::{HandlePool, RecyclableHandle};
use crate::handle::recyclable::Recyclable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::debug;

/// A counted reference to the pool of one path.
pub type RecyclableDatabase = Recyclable<Arc<HandlePool>>;

#[derive(Debug)]
struct Entry {
    pool: Arc<HandlePool>,
    references: usize,
}

/// Registry of the pools of all open databases.
#[derive(Debug)]
pub struct DatabaseRegistry {
    max_handles: usize,
    pools: Mutex<HashMap<PathBuf, Entry>>,
}

impl DatabaseRegistry {
    /// Creates a registry whose pools allow `max_handles` handles each.
    #[must_use]
    pub fn new(max_handles: usize) -> Self {
        Self {
            max_handles,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the key under which `path` is registered.
    ///
    /// Existing files resolve to their canonical path; for new files the
    /// parent directory is canonicalized.
    #[must_use]
    pub fn normalize(path: &Path) -> PathBuf {
        if let Ok(canonical) = fs::canonicalize(path) {
            return canonical;
        }
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                let parent = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
                fs::canonicalize(parent)
                    .map(|parent| parent.join(name))
                    .unwrap_or_else(|_| path.to_path_buf())
            }
            _ => path.to_path_buf(),
        }
    }

    /// Returns a reference to the pool of `path`, creating it if needed.
    pub fn database(self: &Arc<Self>, path: &Path) -> RecyclableDatabase {
        let key = Self::normalize(path);
        let pool = {
            let mut pools = self.pools.lock();
            let entry = pools.entry(key.clone()).or_insert_with(|| {
                debug!(path = %key.display(), "pool created");
                Entry {
                    pool: Arc::new(HandlePool::new(key.clone(), self.max_handles)),
                    references: 0,
                }
            });
            entry.references += 1;
            Arc::clone(&entry.pool)
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        Recyclable::new(pool, move |pool| {
            if let Some(registry) = registry.upgrade() {
                registry.release(&key);
            } else {
                pool.close();
            }
        })
    }

    /// Checks out a handle of `path` configured with `configs`.
    ///
    /// The handle keeps the pool referenced until it is returned.
    ///
    /// # Errors
    ///
    /// See [`HandlePool::acquire`].
    pub fn acquire_handle(self: &Arc<Self>, path: &Path, configs: &Configs) -> CoreResult<RecyclableHandle> {
        let database = self.database(path);
        let mut handle = database.acquire(configs)?;
        handle.hold(database);
        Ok(handle)
    }

    /// Returns the number of live references to the pool of `path`.
    #[must_use]
    pub fn references(&self, path: &Path) -> usize {
        self.pools
            .lock()
            .get(&Self::normalize(path))
            .map_or(0, |entry| entry.references)
    }

    /// Returns the number of open pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Returns true if no pool is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Closes every idle handle of `path`.
    pub fn purge(&self, path: &Path) {
        let pool = self
            .pools
            .lock()
            .get(&Self::normalize(path))
            .map(|entry| Arc::clone(&entry.pool));
        if let Some(pool) = pool {
            pool.purge();
        }
    }

    fn release(&self, key: &Path) {
        let closing = {
            let mut pools = self.pools.lock();
            match pools.get_mut(key) {
                Some(entry) if entry.references > 1 => {
                    entry.references -= 1;
                    None
                }
                Some(_) => pools.remove(key).map(|entry| entry.pool),
                None => None,
            }
        };
        if let Some(pool) = closing {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn one_pool_per_path_across_spellings() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DatabaseRegistry::new(4));
        let path = dir.path().join("a.db");
        let dotted = dir.path().join(".").join("a.db");

        let first = registry.database(&path);
        let second = registry.database(&dotted);
        assert!(Arc::ptr_eq(&*first, &*second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.references(&path), 2);
    }

    #[test]
    fn concurrent_first_use_creates_one_pool() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DatabaseRegistry::new(4));
        let path = dir.path().join("a.db");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let path = path.clone();
                thread::spawn(move || registry.database(&path))
            })
            .collect();
        let databases: Vec<RecyclableDatabase> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect();

        assert!(databases.windows(2).all(|pair| Arc::ptr_eq(&*pair[0], &*pair[1])));
        assert_eq!(registry.references(&path), 8);
    }

    #[test]
    fn last_reference_closes_pool() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DatabaseRegistry::new(4));
        let path = dir.path().join("a.db");

        let handle = registry.acquire_handle(&path, &Configs::new()).unwrap();
        let database = registry.database(&path);
        let pool = Arc::clone(&*database);
        drop(database);
        assert_eq!(registry.len(), 1);

        drop(handle);
        assert!(registry.is_empty());
        assert!(pool.is_closed());
    }
}
