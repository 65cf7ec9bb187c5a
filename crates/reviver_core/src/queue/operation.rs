//! Scheduling of migration, backup and checkpoint work.

use crate::config::CoreConfig;
use crate::error::{CoreResult, ErrorKind};
use crate::handle::{DatabaseRegistry, RecyclableDatabase};
use crate::migration::MigrationStep;
use crate::queue::async_queue::AsyncQueue;
use crate::queue::timed_queue::{Expired, Mode, TimedQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kind of background work registered for a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Incremental table migration.
    Migrate,
    /// Material backup, queued after checkpoints.
    Backup,
    /// Periodic passive checkpoint.
    Checkpoint,
}

type Key = (OperationKind, PathBuf);

/// Receiver of the work the queue schedules.
///
/// The queue holds the receiver weakly; once it is gone every expiry is
/// dropped.
pub trait OperationEvent: Send + Sync {
    /// Runs one migration step of `path`.
    ///
    /// # Errors
    ///
    /// A failed step is retried until the tolerated failure count.
    fn migrate_step(&self, path: &Path) -> CoreResult<MigrationStep>;

    /// Writes a material for `path`.
    ///
    /// # Errors
    ///
    /// Lock errors are retried with backoff; others drop the request.
    fn backup(&self, path: &Path) -> CoreResult<()>;

    /// Checkpoints the WAL of `path`.
    ///
    /// # Errors
    ///
    /// Lock errors are retried with backoff; others wait for the next
    /// interval.
    fn checkpoint(&self, path: &Path) -> CoreResult<()>;
}

#[derive(Debug, Default)]
struct Registrations {
    databases: HashMap<Key, RecyclableDatabase>,
    failures: HashMap<Key, u32>,
}

/// One worker thread serving the background work of every database.
pub struct OperationQueue {
    config: CoreConfig,
    registry: Arc<DatabaseRegistry>,
    event: Weak<dyn OperationEvent>,
    timed: Arc<TimedQueue<Key, ()>>,
    worker: AsyncQueue,
    registrations: Mutex<Registrations>,
    me: Weak<Self>,
}

impl OperationQueue {
    /// Creates a queue delivering work to `event`. The worker thread starts
    /// with the first registration.
    pub fn new(
        config: CoreConfig,
        registry: Arc<DatabaseRegistry>,
        event: Weak<dyn OperationEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            registry,
            event,
            timed: Arc::new(TimedQueue::new(Mode::Reset)),
            worker: AsyncQueue::new("reviver-operation"),
            registrations: Mutex::new(Registrations::default()),
            me: me.clone(),
        })
    }

    /// Enables or disables `kind` for `path`.
    ///
    /// A registration keeps the database's pool open. Migration starts
    /// right away and checkpoints after one interval; backups only run when
    /// a checkpoint or [`OperationQueue::queue_backup`] asks for one.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started.
    pub fn register(&self, kind: OperationKind, path: &Path, enabled: bool) -> CoreResult<()> {
        let key = (kind, DatabaseRegistry::normalize(path));
        if !enabled {
            self.unregister(&key);
            return Ok(());
        }
        self.ensure_started()?;
        {
            let mut registrations = self.registrations.lock();
            if registrations.databases.contains_key(&key) {
                return Ok(());
            }
            let database = self.registry.database(&key.1);
            registrations.databases.insert(key.clone(), database);
        }
        debug!(path = %key.1.display(), kind = ?kind, "operation registered");
        match kind {
            OperationKind::Migrate => self.timed.re_queue(key, Duration::ZERO, ()),
            OperationKind::Checkpoint => {
                self.timed.re_queue(key, self.config.checkpoint_interval, ());
            }
            OperationKind::Backup => {}
        }
        Ok(())
    }

    /// Returns true if `kind` is enabled for `path`.
    #[must_use]
    pub fn is_registered(&self, kind: OperationKind, path: &Path) -> bool {
        let key = (kind, DatabaseRegistry::normalize(path));
        self.registrations.lock().databases.contains_key(&key)
    }

    /// Returns true if `kind` work for `path` is waiting for its deadline.
    #[must_use]
    pub fn is_pending(&self, kind: OperationKind, path: &Path) -> bool {
        self.timed.contains(&(kind, DatabaseRegistry::normalize(path)))
    }

    /// Asks for a backup of `path` within one backup interval.
    ///
    /// Requests arriving while one is pending do not postpone it. Ignored
    /// unless backups are enabled for `path`.
    pub fn queue_backup(&self, path: &Path) {
        self.queue_backup_key((OperationKind::Backup, DatabaseRegistry::normalize(path)));
    }

    fn queue_backup_key(&self, key: Key) {
        if !self.registrations.lock().databases.contains_key(&key) {
            return;
        }
        self.timed
            .re_queue_with(key, self.config.backup_interval, (), Mode::ForwardOnly);
    }

    /// Stops the worker and drops every registration.
    pub fn stop(&self) {
        self.timed.stop();
        self.worker.stop();
        self.worker.join();
        let databases = std::mem::take(&mut self.registrations.lock().databases);
        drop(databases);
    }

    fn ensure_started(&self) -> CoreResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let me = self.me.clone();
        let timed = Arc::clone(&self.timed);
        match self.worker.run(move |_| {
            timed.run_loop(|key, ()| match me.upgrade() {
                Some(queue) => queue.on_expired(key),
                None => Expired::Done,
            });
        }) {
            Err(error) if error.kind() == ErrorKind::InvalidOperation => Ok(()),
            other => other,
        }
    }

    fn unregister(&self, key: &Key) {
        self.timed.remove(key);
        let database = {
            let mut registrations = self.registrations.lock();
            registrations.failures.remove(key);
            registrations.databases.remove(key)
        };
        if database.is_some() {
            debug!(path = %key.1.display(), kind = ?key.0, "operation unregistered");
        }
    }

    fn failures(&self, key: &Key) -> u32 {
        self.registrations.lock().failures.get(key).copied().unwrap_or(0)
    }

    fn record_failure(&self, key: &Key) -> u32 {
        let mut registrations = self.registrations.lock();
        let failures = registrations.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        *failures
    }

    fn reset_failures(&self, key: &Key) {
        self.registrations.lock().failures.remove(key);
    }

    fn on_expired(&self, key: &Key) -> Expired {
        if !self.registrations.lock().databases.contains_key(key) {
            return Expired::Done;
        }
        let Some(event) = self.event.upgrade() else {
            return Expired::Done;
        };
        let (kind, path) = key;
        match kind {
            OperationKind::Migrate => self.on_migrate(key, event.migrate_step(path)),
            OperationKind::Checkpoint => self.on_checkpoint(key, event.checkpoint(path)),
            OperationKind::Backup => self.on_backup(key, event.backup(path)),
        }
    }

    fn on_migrate(&self, key: &Key, result: CoreResult<MigrationStep>) -> Expired {
        match result {
            Ok(MigrationStep::Completed) => {
                info!(path = %key.1.display(), "migration finished");
                self.unregister(key);
                Expired::Done
            }
            Ok(MigrationStep::Progressing { .. }) => {
                self.reset_failures(key);
                Expired::Retry(self.config.migration_interval)
            }
            Err(error) => {
                let failures = self.record_failure(key);
                if failures >= self.config.tolerable_migration_failures {
                    warn!(path = %key.1.display(), error = %error, failures, "migration abandoned");
                    self.unregister(key);
                    Expired::Done
                } else {
                    warn!(path = %key.1.display(), error = %error, failures, "migration step failed");
                    Expired::Retry(self.config.migration_retry_interval)
                }
            }
        }
    }

    fn on_checkpoint(&self, key: &Key, result: CoreResult<()>) -> Expired {
        match result {
            Ok(()) => {
                self.reset_failures(key);
                self.queue_backup_key((OperationKind::Backup, key.1.clone()));
                Expired::Retry(self.config.checkpoint_interval)
            }
            Err(error) if error.kind() == ErrorKind::Lock => {
                let delay = self.config.lock_retry_delay(self.failures(key));
                self.record_failure(key);
                debug!(path = %key.1.display(), delay_ms = delay.as_millis() as u64, "checkpoint lost a lock race");
                Expired::Retry(delay)
            }
            Err(error) => {
                warn!(path = %key.1.display(), error = %error, "checkpoint failed");
                Expired::Retry(self.config.checkpoint_interval)
            }
        }
    }

    fn on_backup(&self, key: &Key, result: CoreResult<()>) -> Expired {
        match result {
            Ok(()) => {
                self.reset_failures(key);
                Expired::Done
            }
            Err(error) if error.kind() == ErrorKind::Lock => {
                let delay = self.config.lock_retry_delay(self.failures(key));
                self.record_failure(key);
                debug!(path = %key.1.display(), delay_ms = delay.as_millis() as u64, "backup lost a lock race");
                Expired::Retry(delay)
            }
            Err(error) => {
                self.reset_failures(key);
                warn!(path = %key.1.display(), error = %error, "backup failed");
                Expired::Done
            }
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("pending", &self.timed.len())
            .field("registrations", &self.registrations.lock().databases.len())
            .finish_non_exhaustive()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.timed.stop();
        self.worker.stop();
        self.worker.join();
    }
}
