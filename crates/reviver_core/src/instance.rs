//! The entry point tying pools, locks, repair and background work together.

use crate::config::{CoreConfig, RepairConfig};
use crate::error::CoreResult;
use crate::handle::{CheckpointMode, Configs, DatabaseRegistry, RecyclableDatabase, RecyclableHandle};
use crate::lock::{BackupHandle, PathLockRegistry};
use crate::migration::{Migration, MigrationInfo, MigrationStep};
use crate::progress::{Progress, ProgressCallback};
use crate::queue::{OperationEvent, OperationKind, OperationQueue};
use crate::repair::{Backup, BackupFilter, IncrementalMaterial, Material, RepairResult, Repairman};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct PendingMigration {
    info: MigrationInfo,
    failures: u32,
}

#[derive(Default)]
struct BackupSettings {
    filter: Option<BackupFilter>,
    incremental: Option<IncrementalMaterial>,
}

/// Shared state of every database a process works with.
///
/// All paths are normalized with [`DatabaseRegistry::normalize`], so two
/// spellings of one file share pools, locks and queue registrations. The
/// pool of a database stays open from its first use until
/// [`Core::close_database`] or [`Core::close`], so returned handles are
/// reused instead of reopened.
pub struct Core {
    config: CoreConfig,
    databases: Arc<DatabaseRegistry>,
    locks: Arc<PathLockRegistry>,
    queue: Arc<OperationQueue>,
    opened: Mutex<HashMap<PathBuf, RecyclableDatabase>>,
    migrations: Mutex<HashMap<PathBuf, Vec<PendingMigration>>>,
    backups: Mutex<HashMap<PathBuf, BackupSettings>>,
}

impl Core {
    /// Creates a core with its own registries and an idle operation queue.
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let event: Weak<dyn OperationEvent> = me.clone();
            let databases = Arc::new(DatabaseRegistry::new(config.max_handles));
            let queue = OperationQueue::new(config.clone(), Arc::clone(&databases), event);
            Self {
                config,
                databases,
                locks: Arc::new(PathLockRegistry::new()),
                queue,
                opened: Mutex::new(HashMap::new()),
                migrations: Mutex::new(HashMap::new()),
                backups: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Returns the pool registry.
    #[must_use]
    pub fn databases(&self) -> &Arc<DatabaseRegistry> {
        &self.databases
    }

    /// Returns the in-process lock registry.
    #[must_use]
    pub fn locks(&self) -> &Arc<PathLockRegistry> {
        &self.locks
    }

    /// Checks out a handle of `path` configured with `configs`.
    ///
    /// The first call for a path opens its pool; later calls reuse idle
    /// handles of that pool.
    ///
    /// # Errors
    ///
    /// See [`crate::handle::HandlePool::acquire`].
    pub fn acquire_handle(&self, path: &Path, configs: &Configs) -> CoreResult<RecyclableHandle> {
        let key = DatabaseRegistry::normalize(path);
        {
            let mut opened = self.opened.lock();
            if !opened.contains_key(&key) {
                let database = self.databases.database(&key);
                opened.insert(key.clone(), database);
            }
        }
        self.databases.acquire_handle(&key, configs)
    }

    /// Releases the core's reference to the pool of `path`. The pool closes
    /// once no handle or registration uses it anymore.
    pub fn close_database(&self, path: &Path) {
        let path = DatabaseRegistry::normalize(path);
        if self.opened.lock().remove(&path).is_some() {
            debug!(path = %path.display(), "database released");
        }
    }

    /// Repairs `source` into `target` with default options.
    pub fn repair(
        &self,
        source: &Path,
        target: &Path,
        on_progress: Option<ProgressCallback>,
    ) -> RepairResult {
        let progress = match on_progress {
            Some(callback) => Progress::new().with_callback(callback),
            None => Progress::new(),
        };
        self.repair_with(source, target, RepairConfig::default(), progress)
    }

    /// Repairs `source` into `target`.
    ///
    /// Without a key of its own, `config` uses the core's material key.
    pub fn repair_with(
        &self,
        source: &Path,
        target: &Path,
        mut config: RepairConfig,
        progress: Progress,
    ) -> RepairResult {
        if config.material_key.is_none() {
            config.material_key = self.config.material_key.clone();
        }
        Repairman::new(
            DatabaseRegistry::normalize(source),
            DatabaseRegistry::normalize(target),
        )
        .with_config(config)
        .with_registry(Arc::clone(&self.locks))
        .with_lock_timeout(self.config.lock_timeout)
        .with_progress(progress)
        .work()
    }

    /// Writes a material for `path` and returns where it was saved.
    ///
    /// With incremental backups enabled, a backup taken in the same WAL
    /// generation as the previous one only re-hashes pages of that WAL.
    ///
    /// # Errors
    ///
    /// Returns a lock error when a checkpoint holds the database, and any
    /// error reading the database or writing the material.
    pub fn backup(&self, path: &Path) -> CoreResult<PathBuf> {
        let path = DatabaseRegistry::normalize(path);
        let (filter, incremental) = {
            let backups = self.backups.lock();
            let settings = backups.get(&path);
            (
                settings.and_then(|settings| settings.filter.clone()),
                settings
                    .and_then(|settings| settings.incremental)
                    .filter(|_| self.config.incremental_backup),
            )
        };

        let mut lock = BackupHandle::for_path(&self.locks, &path, self.config.lock_timeout);
        let mut backup = Backup::new(&path)
            .with_key(self.config.material_key.clone())
            .with_filter(filter)
            .with_incremental(incremental.or(Some(IncrementalMaterial::default())));
        let saved = backup.save(&mut lock)?;

        let state = backup.incremental();
        self.backups.lock().entry(path.clone()).or_default().incremental = state;
        info!(
            path = %path.display(),
            material = %saved.display(),
            incremental = state.is_some_and(|state| state.is_incremental()),
            "backup saved"
        );
        Ok(saved)
    }

    /// Restricts backups of `path` to the tables `filter` accepts. `None`
    /// backs up every table again.
    pub fn set_backup_filter(&self, path: &Path, filter: Option<BackupFilter>) {
        let mut backups = self.backups.lock();
        let settings = backups.entry(DatabaseRegistry::normalize(path)).or_default();
        settings.filter = filter;
        settings.incremental = None;
    }

    /// Returns the state the last backup of `path` left for the next one.
    #[must_use]
    pub fn incremental_material(&self, path: &Path) -> Option<IncrementalMaterial> {
        self.backups
            .lock()
            .get(&DatabaseRegistry::normalize(path))
            .and_then(|settings| settings.incremental)
    }

    /// Deletes every material of `path`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a removal.
    pub fn remove_backup(&self, path: &Path) -> CoreResult<()> {
        let path = DatabaseRegistry::normalize(path);
        if let Some(settings) = self.backups.lock().get_mut(&path) {
            settings.incremental = None;
        }
        Material::remove(&path)
    }

    /// Enables or disables backups of `path` after checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started.
    pub fn set_auto_backup(&self, path: &Path, enabled: bool) -> CoreResult<()> {
        self.queue.register(OperationKind::Backup, path, enabled)
    }

    /// Enables or disables stepping the migrations added for `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started.
    pub fn set_auto_migrate(&self, path: &Path, enabled: bool) -> CoreResult<()> {
        self.queue.register(OperationKind::Migrate, path, enabled)
    }

    /// Enables or disables periodic checkpoints of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started.
    pub fn set_auto_checkpoint(&self, path: &Path, enabled: bool) -> CoreResult<()> {
        self.queue.register(OperationKind::Checkpoint, path, enabled)
    }

    /// Adds a table migration for `path`. Migrations run in the order they
    /// were added once auto migration is enabled. One that keeps failing is
    /// dropped after [`CoreConfig::tolerable_migration_failures`] attempts.
    pub fn add_migration(&self, path: &Path, info: MigrationInfo) {
        self.migrations
            .lock()
            .entry(DatabaseRegistry::normalize(path))
            .or_default()
            .push(PendingMigration { info, failures: 0 });
    }

    /// Returns the migrations of `path` neither completed nor dropped.
    #[must_use]
    pub fn pending_migrations(&self, path: &Path) -> Vec<MigrationInfo> {
        self.migrations
            .lock()
            .get(&DatabaseRegistry::normalize(path))
            .map(|pending| pending.iter().map(|pending| pending.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns true if `kind` work is enabled for `path`.
    #[must_use]
    pub fn is_scheduled(&self, kind: OperationKind, path: &Path) -> bool {
        self.queue.is_registered(kind, path)
    }

    /// Stops background work and releases the pools the core opened.
    /// Handles already checked out stay usable.
    pub fn close(&self) {
        self.queue.stop();
        let opened = std::mem::take(&mut *self.opened.lock());
        drop(opened);
        debug!("core closed");
    }

    /// Removes `info` from the pending migrations of `path`. Returns true
    /// if other migrations are still pending.
    fn finish_migration(&self, path: &Path, info: &MigrationInfo) -> bool {
        let mut migrations = self.migrations.lock();
        let remaining = migrations.get_mut(path).map_or(0, |pending| {
            pending.retain(|pending| &pending.info != info);
            pending.len()
        });
        if remaining == 0 {
            migrations.remove(path);
        }
        remaining > 0
    }

    fn record_migration_failure(&self, path: &Path, info: &MigrationInfo) -> u32 {
        self.migrations
            .lock()
            .get_mut(path)
            .and_then(|pending| pending.iter_mut().find(|pending| &pending.info == info))
            .map_or(0, |pending| {
                pending.failures += 1;
                pending.failures
            })
    }
}

impl OperationEvent for Core {
    fn migrate_step(&self, path: &Path) -> CoreResult<MigrationStep> {
        let Some(info) = self
            .migrations
            .lock()
            .get(path)
            .and_then(|pending| pending.first().map(|pending| pending.info.clone()))
        else {
            return Ok(MigrationStep::Completed);
        };

        let handle = self.acquire_handle(path, &Configs::new())?;
        let step = Migration::new(self.config.migration_batch_rows, self.config.migration_step_budget)
            .step(&handle, &info);
        drop(handle);

        let completed = match step {
            Ok(MigrationStep::Completed) => true,
            Ok(progressing) => {
                if let Some(pending) = self
                    .migrations
                    .lock()
                    .get_mut(path)
                    .and_then(|pending| pending.first_mut())
                {
                    pending.failures = 0;
                }
                return Ok(progressing);
            }
            Err(error) => {
                let failures = self.record_migration_failure(path, &info);
                if failures < self.config.tolerable_migration_failures {
                    return Err(error);
                }
                warn!(
                    path = %path.display(),
                    table = %info.table,
                    source = %info.source_table,
                    error = %error,
                    failures,
                    "migration dropped"
                );
                false
            }
        };

        if completed {
            debug!(path = %path.display(), table = %info.table, "table migrated");
        }
        if self.finish_migration(path, &info) {
            Ok(MigrationStep::Progressing { moved: 0 })
        } else {
            Ok(MigrationStep::Completed)
        }
    }

    fn backup(&self, path: &Path) -> CoreResult<()> {
        Core::backup(self, path).map(|_| ())
    }

    fn checkpoint(&self, path: &Path) -> CoreResult<()> {
        let mut lock = BackupHandle::for_path(&self.locks, path, self.config.lock_timeout);
        lock.acquire_write_lock()?;
        let result = self
            .acquire_handle(path, &Configs::new())
            .and_then(|handle| handle.checkpoint(CheckpointMode::Passive));
        if let Err(error) = lock.release_write_lock() {
            warn!(path = %path.display(), error = %error, "releasing checkpoint write lock failed");
        }
        result.map(|_| ())
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("databases", &self.databases.len())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn fast_core() -> Arc<Core> {
        Core::new(
            CoreConfig::new()
                .migration_interval(Duration::from_millis(1))
                .checkpoint_interval(Duration::from_millis(10))
                .backup_interval(Duration::from_millis(10))
                .lock_timeout(Duration::from_millis(200)),
        )
    }

    fn populate(core: &Core, path: &Path) {
        let handle = core.acquire_handle(path, &Configs::new()).unwrap();
        handle
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT);
                 WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 200)
                 INSERT INTO notes SELECT i, 'note ' || i FROM n;",
            )
            .unwrap();
    }

    #[test]
    fn backup_then_repair_through_core() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();
        populate(&core, &path);

        let saved = core.backup(&path).unwrap();
        assert!(saved.exists());

        let result = core.repair(&path, &dir.path().join("fixed.db"), None);
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.recovered_table_count, 1);

        core.remove_backup(&path).unwrap();
        assert!(!Material::exists(&path));
    }

    #[test]
    fn auto_migration_moves_every_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();
        populate(&core, &path);
        {
            let handle = core.acquire_handle(&path, &Configs::new()).unwrap();
            handle
                .execute_batch(
                    "CREATE TABLE notes_v2(id INTEGER PRIMARY KEY, body TEXT);
                     CREATE TABLE tags(id INTEGER PRIMARY KEY, name TEXT);
                     CREATE TABLE tags_v2(id INTEGER PRIMARY KEY, name TEXT);
                     INSERT INTO tags VALUES(1, 'red'), (2, 'blue');",
                )
                .unwrap();
        }

        core.add_migration(&path, MigrationInfo::new("notes_v2", "notes"));
        core.add_migration(&path, MigrationInfo::new("tags_v2", "tags"));
        core.set_auto_migrate(&path, true).unwrap();

        assert!(wait_until(|| !core.is_scheduled(OperationKind::Migrate, &path)));
        assert!(core.pending_migrations(&path).is_empty());

        let handle = core.acquire_handle(&path, &Configs::new()).unwrap();
        let count: i64 = handle
            .connection()
            .query_row("SELECT count(*) FROM notes_v2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 200);
        assert!(!handle.table_exists("main", "notes").unwrap());
        assert!(!handle.table_exists("main", "tags").unwrap());
        core.close();
    }

    #[test]
    fn auto_checkpoint_triggers_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();
        populate(&core, &path);

        core.set_auto_backup(&path, true).unwrap();
        core.set_auto_checkpoint(&path, true).unwrap();
        assert!(wait_until(|| Material::exists(&path)));
        core.close();
    }

    #[test]
    fn checkpoint_waits_for_running_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();
        populate(&core, &path);
        let key = DatabaseRegistry::normalize(&path);

        core.locks().lock_read(&key, Duration::from_secs(1)).unwrap();
        let error = OperationEvent::checkpoint(&*core, &key).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Lock);
        core.locks().unlock_read(&key);

        OperationEvent::checkpoint(&*core, &key).unwrap();
    }

    #[test]
    fn returned_handle_is_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();

        let first = core.acquire_handle(&path, &Configs::new()).unwrap().id();
        let second = core.acquire_handle(&path, &Configs::new()).unwrap().id();

        assert_eq!(first.index(), second.index());
        assert_eq!(core.databases().len(), 1);
        assert_eq!(core.databases().references(&path), 1);

        core.close_database(&path);
        assert!(core.databases().is_empty());
    }

    #[test]
    fn failing_migration_is_dropped_and_later_ones_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = Core::new(
            CoreConfig::new()
                .migration_interval(Duration::from_millis(1))
                .migration_retry_interval(Duration::from_millis(1))
                .tolerable_migration_failures(2),
        );
        populate(&core, &path);
        {
            let handle = core.acquire_handle(&path, &Configs::new()).unwrap();
            handle
                .execute_batch(
                    "CREATE TABLE tags(id INTEGER PRIMARY KEY, name TEXT);
                     CREATE TABLE tags_v2(id INTEGER PRIMARY KEY, name TEXT);
                     INSERT INTO tags VALUES(1, 'red'), (2, 'blue');",
                )
                .unwrap();
        }

        core.add_migration(&path, MigrationInfo::new("absent", "notes"));
        core.add_migration(&path, MigrationInfo::new("tags_v2", "tags"));
        core.set_auto_migrate(&path, true).unwrap();

        assert!(wait_until(|| !core.is_scheduled(OperationKind::Migrate, &path)));
        assert!(core.pending_migrations(&path).is_empty());

        let handle = core.acquire_handle(&path, &Configs::new()).unwrap();
        let count: i64 = handle
            .connection()
            .query_row("SELECT count(*) FROM tags_v2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert!(handle.table_exists("main", "notes").unwrap());
        assert!(!handle.table_exists("main", "tags").unwrap());
        core.close();
    }

    #[test]
    fn second_backup_in_one_wal_generation_is_incremental() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let core = fast_core();
        populate(&core, &path);

        core.backup(&path).unwrap();
        let state = core.incremental_material(&path).expect("state recorded");
        assert!(!state.is_incremental());

        core.acquire_handle(&path, &Configs::new())
            .unwrap()
            .execute_batch("UPDATE notes SET body = 'changed' WHERE id = 7")
            .unwrap();
        core.backup(&path).unwrap();
        let state = core.incremental_material(&path).expect("state recorded");
        assert!(state.is_incremental());

        core.remove_backup(&path).unwrap();
        assert!(core.incremental_material(&path).is_none());
    }

    #[test]
    fn checkpoint_error_is_returned_after_unlocking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("a.db");
        let core = fast_core();
        let key = DatabaseRegistry::normalize(&path);

        let error = OperationEvent::checkpoint(&*core, &key).unwrap_err();
        assert_ne!(error.kind(), ErrorKind::Lock);
        core.locks().lock_read(&key, Duration::from_millis(50)).unwrap();
        core.locks().unlock_read(&key);
    }
}
