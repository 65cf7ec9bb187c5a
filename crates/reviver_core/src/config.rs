//! Core configuration.

use crate::repair::CipherKey;
use std::time::Duration;

/// Configuration shared by the pool registry, lockers and background queues.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum number of handles a single pool may have checked out.
    pub max_handles: usize,

    /// How long lockers wait before failing with a lock error.
    pub lock_timeout: Duration,

    /// Delay between two migration steps of the same database.
    pub migration_interval: Duration,

    /// Delay before retrying a failed migration step.
    pub migration_retry_interval: Duration,

    /// Consecutive failed steps after which migration is abandoned.
    pub tolerable_migration_failures: u32,

    /// Maximum rows moved by one migration step.
    pub migration_batch_rows: usize,

    /// Wall-clock budget of one migration step.
    pub migration_step_budget: Duration,

    /// Delay between two automatic checkpoints.
    pub checkpoint_interval: Duration,

    /// Debounce window of automatic backups.
    pub backup_interval: Duration,

    /// First retry delay after a backup or checkpoint lost a lock race.
    /// Doubles on every consecutive failure up to `lock_retry_cap`.
    pub lock_retry_base: Duration,

    /// Upper bound for lock retry delays.
    pub lock_retry_cap: Duration,

    /// Key used to encrypt materials written by backups.
    pub material_key: Option<CipherKey>,

    /// Whether a backup may extend the previous material instead of
    /// hashing every leaf page again.
    pub incremental_backup: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_handles: 32,
            lock_timeout: Duration::from_secs(10),
            migration_interval: Duration::from_secs(2),
            migration_retry_interval: Duration::from_secs(5),
            tolerable_migration_failures: 5,
            migration_batch_rows: 64,
            migration_step_budget: Duration::from_millis(10),
            checkpoint_interval: Duration::from_secs(10),
            backup_interval: Duration::from_secs(600),
            lock_retry_base: Duration::from_secs(1),
            lock_retry_cap: Duration::from_secs(60),
            material_key: None,
            incremental_backup: true,
        }
    }
}

impl CoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of checked-out handles per pool.
    #[must_use]
    pub const fn max_handles(mut self, value: usize) -> Self {
        self.max_handles = value;
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, value: Duration) -> Self {
        self.lock_timeout = value;
        self
    }

    /// Sets the delay between migration steps.
    #[must_use]
    pub const fn migration_interval(mut self, value: Duration) -> Self {
        self.migration_interval = value;
        self
    }

    /// Sets the retry delay after a failed migration step.
    #[must_use]
    pub const fn migration_retry_interval(mut self, value: Duration) -> Self {
        self.migration_retry_interval = value;
        self
    }

    /// Sets the number of tolerated consecutive migration failures.
    #[must_use]
    pub const fn tolerable_migration_failures(mut self, value: u32) -> Self {
        self.tolerable_migration_failures = value;
        self
    }

    /// Sets the maximum rows moved per migration step.
    #[must_use]
    pub const fn migration_batch_rows(mut self, value: usize) -> Self {
        self.migration_batch_rows = value;
        self
    }

    /// Sets the time budget of one migration step.
    #[must_use]
    pub const fn migration_step_budget(mut self, value: Duration) -> Self {
        self.migration_step_budget = value;
        self
    }

    /// Sets the automatic checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, value: Duration) -> Self {
        self.checkpoint_interval = value;
        self
    }

    /// Sets the automatic backup debounce window.
    #[must_use]
    pub const fn backup_interval(mut self, value: Duration) -> Self {
        self.backup_interval = value;
        self
    }

    /// Sets the lock retry base delay.
    #[must_use]
    pub const fn lock_retry_base(mut self, value: Duration) -> Self {
        self.lock_retry_base = value;
        self
    }

    /// Sets the material encryption key.
    #[must_use]
    pub fn material_key(mut self, key: CipherKey) -> Self {
        self.material_key = Some(key);
        self
    }

    /// Enables or disables incremental backups.
    #[must_use]
    pub const fn incremental_backup(mut self, enabled: bool) -> Self {
        self.incremental_backup = enabled;
        self
    }

    /// Returns the retry delay after `failures` consecutive lock failures.
    #[must_use]
    pub fn lock_retry_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
        self.lock_retry_base
            .saturating_mul(factor)
            .min(self.lock_retry_cap)
    }
}

/// Options of a single repair session.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Use a material written by a previous backup when one is present.
    pub use_material: bool,

    /// Scan unreachable pages for rows of tables whose crawl hit corruption.
    pub full_crawl_fallback: bool,

    /// Keep the first row when two crawled rows share a rowid.
    pub ignore_duplicates: bool,

    /// Overlay committed WAL frames onto the main file.
    pub use_wal: bool,

    /// Key of an encrypted material.
    pub material_key: Option<CipherKey>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            use_material: true,
            full_crawl_fallback: true,
            ignore_duplicates: true,
            use_wal: true,
            material_key: None,
        }
    }
}

impl RepairConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether a material may guide the repair.
    #[must_use]
    pub const fn use_material(mut self, value: bool) -> Self {
        self.use_material = value;
        self
    }

    /// Sets whether orphan pages are scanned.
    #[must_use]
    pub const fn full_crawl_fallback(mut self, value: bool) -> Self {
        self.full_crawl_fallback = value;
        self
    }

    /// Sets the duplicate row policy.
    #[must_use]
    pub const fn ignore_duplicates(mut self, value: bool) -> Self {
        self.ignore_duplicates = value;
        self
    }

    /// Sets whether WAL frames are read.
    #[must_use]
    pub const fn use_wal(mut self, value: bool) -> Self {
        self.use_wal = value;
        self
    }

    /// Sets the material key.
    #[must_use]
    pub fn material_key(mut self, key: CipherKey) -> Self {
        self.material_key = Some(key);
        self
    }
}
