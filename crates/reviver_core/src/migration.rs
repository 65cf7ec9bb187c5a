//! Incremental table migration.
//!
//! Rows move from a source table, optionally in another database file,
//! into a target table of the handle's main database. Each step moves a
//! bounded batch inside one transaction so foreground writers are never
//! blocked for long. Rows keep their rowid; the source table is dropped
//! once empty.
//!
//! Only rowid tables can be migrated.

use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::repair::quote_identifier;
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SOURCE_SCHEMA: &str = "reviver_migration_source";

/// Where the rows of one table come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MigrationInfo {
    /// Target table in the main database.
    pub table: String,
    /// Source table name.
    pub source_table: String,
    /// Database file holding the source table; `None` for the main database.
    pub source_database: Option<PathBuf>,
}

impl MigrationInfo {
    /// Migrates `source_table` into `table` within the same database.
    #[must_use]
    pub fn new(table: impl Into<String>, source_table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_table: source_table.into(),
            source_database: None,
        }
    }

    /// Reads the source table from another database file.
    #[must_use]
    pub fn with_source_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_database = Some(path.into());
        self
    }

    fn source_schema(&self) -> &'static str {
        if self.source_database.is_some() {
            SOURCE_SCHEMA
        } else {
            "main"
        }
    }

    fn qualified_source(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(self.source_schema()),
            quote_identifier(&self.source_table)
        )
    }
}

/// Outcome of one migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStep {
    /// Rows were moved and more remain.
    Progressing {
        /// Rows moved by this step.
        moved: usize,
    },
    /// The source table is gone.
    Completed,
}

/// Moves rows in bounded steps.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    batch_rows: usize,
    budget: Duration,
}

impl Migration {
    /// Creates a stepper moving at most `batch_rows` rows within `budget`
    /// per step. At least one row is moved per step.
    #[must_use]
    pub const fn new(batch_rows: usize, budget: Duration) -> Self {
        Self { batch_rows, budget }
    }

    /// Runs one step of `info` on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MigrationFailed`] when the target table is
    /// missing or shares no column with the source, and engine errors from
    /// the statements. A failed step is rolled back.
    pub fn step(&self, handle: &Handle, info: &MigrationInfo) -> CoreResult<MigrationStep> {
        let result = self.run_step(handle, info);
        if result.is_err() {
            if let Err(error) = detach_source(handle, info) {
                warn!(table = %info.table, %error, "failed to detach migration source");
            }
        }
        result
    }

    fn run_step(&self, handle: &Handle, info: &MigrationInfo) -> CoreResult<MigrationStep> {
        attach_source(handle, info)?;
        let schema = info.source_schema();

        if !handle.table_exists(schema, &info.source_table)? {
            detach_source(handle, info)?;
            return Ok(MigrationStep::Completed);
        }
        if !handle.table_exists("main", &info.table)? {
            return Err(CoreError::migration_failed(format!(
                "target table {} does not exist",
                info.table
            )));
        }

        let columns = common_columns(handle, info)?;
        handle.execute_batch("BEGIN IMMEDIATE")?;
        match self.move_batch(handle, info, &columns) {
            Ok(step) => {
                handle.execute_batch("COMMIT")?;
                if step == MigrationStep::Completed {
                    detach_source(handle, info)?;
                    info!(table = %info.table, source = %info.source_table, "migration completed");
                }
                Ok(step)
            }
            Err(error) => {
                handle.rollback_if_needed()?;
                Err(error)
            }
        }
    }

    fn move_batch(
        &self,
        handle: &Handle,
        info: &MigrationInfo,
        columns: &str,
    ) -> CoreResult<MigrationStep> {
        let source = info.qualified_source();
        let connection = handle.connection();

        let rowids = {
            let mut statement =
                connection.prepare(&format!("SELECT rowid FROM {source} ORDER BY rowid LIMIT ?1"))?;
            let limit = i64::try_from(self.batch_rows.max(1)).unwrap_or(i64::MAX);
            let rowids = statement
                .query_map([limit], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rowids
        };
        if rowids.is_empty() {
            handle.execute_batch(&format!("DROP TABLE {source}"))?;
            return Ok(MigrationStep::Completed);
        }

        let mut insert = connection.prepare(&format!(
            "INSERT OR REPLACE INTO main.{}(rowid, {columns}) SELECT rowid, {columns} FROM {source} WHERE rowid = ?1",
            quote_identifier(&info.table)
        ))?;
        let mut delete = connection.prepare(&format!("DELETE FROM {source} WHERE rowid = ?1"))?;

        let started = Instant::now();
        let mut moved = 0;
        for rowid in rowids {
            insert.execute([rowid])?;
            delete.execute([rowid])?;
            moved += 1;
            if started.elapsed() >= self.budget {
                break;
            }
        }
        debug!(table = %info.table, moved, "migration step");
        Ok(MigrationStep::Progressing { moved })
    }
}

fn common_columns(handle: &Handle, info: &MigrationInfo) -> CoreResult<String> {
    let source = handle.column_names(info.source_schema(), &info.source_table)?;
    let columns: Vec<String> = handle
        .column_names("main", &info.table)?
        .into_iter()
        .filter(|column| source.contains(column))
        .map(|column| quote_identifier(&column))
        .collect();
    if columns.is_empty() {
        return Err(CoreError::migration_failed(format!(
            "{} and {} share no column",
            info.table, info.source_table
        )));
    }
    Ok(columns.join(", "))
}

/// File currently attached as the migration source, if any.
fn attached_file(handle: &Handle) -> CoreResult<Option<PathBuf>> {
    let file = handle
        .connection()
        .query_row(
            "SELECT file FROM pragma_database_list WHERE name = ?1",
            [SOURCE_SCHEMA],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(file.map(PathBuf::from))
}

fn is_attached(handle: &Handle) -> CoreResult<bool> {
    Ok(attached_file(handle)?.is_some())
}

fn same_file(left: &Path, right: &Path) -> bool {
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

fn attach_source(handle: &Handle, info: &MigrationInfo) -> CoreResult<()> {
    let Some(path) = &info.source_database else {
        return Ok(());
    };
    match attached_file(handle)? {
        Some(attached) if same_file(&attached, path) => return Ok(()),
        Some(attached) => {
            debug!(stale = %attached.display(), source = %path.display(), "replacing migration source");
            handle.execute_batch(&format!("DETACH DATABASE {}", quote_identifier(SOURCE_SCHEMA)))?;
        }
        None => {}
    }
    handle.execute(
        &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(SOURCE_SCHEMA)),
        [path.to_string_lossy().into_owned()],
    )?;
    Ok(())
}

fn detach_source(handle: &Handle, info: &MigrationInfo) -> CoreResult<()> {
    if info.source_database.is_some() && is_attached(handle)? {
        handle.rollback_if_needed()?;
        handle.execute_batch(&format!("DETACH DATABASE {}", quote_identifier(SOURCE_SCHEMA)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn count(handle: &Handle, sql: &str) -> i64 {
        handle.connection().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn seeded(rows: i64) -> (tempfile::TempDir, Handle) {
        let dir = tempdir().unwrap();
        let handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle
            .execute_batch(
                "CREATE TABLE old_users(id INTEGER PRIMARY KEY, name TEXT, legacy BLOB);
                 CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT, email TEXT);",
            )
            .unwrap();
        for id in 1..=rows {
            handle
                .execute("INSERT INTO old_users VALUES(?1, ?2, x'00')", (id, format!("user{id}")))
                .unwrap();
        }
        (dir, handle)
    }

    #[test]
    fn steps_are_bounded_until_source_is_dropped() {
        let (_dir, handle) = seeded(10);
        let migration = Migration::new(4, Duration::from_secs(10));
        let info = MigrationInfo::new("users", "old_users");

        let mut steps = Vec::new();
        loop {
            let step = migration.step(&handle, &info).unwrap();
            steps.push(step);
            if step == MigrationStep::Completed {
                break;
            }
        }

        assert_eq!(
            steps,
            [
                MigrationStep::Progressing { moved: 4 },
                MigrationStep::Progressing { moved: 4 },
                MigrationStep::Progressing { moved: 2 },
                MigrationStep::Completed,
            ]
        );
        assert_eq!(count(&handle, "SELECT count(*) FROM users"), 10);
        assert_eq!(count(&handle, "SELECT max(id) FROM users"), 10);
        assert!(!handle.table_exists("main", "old_users").unwrap());
        assert_eq!(migration.step(&handle, &info).unwrap(), MigrationStep::Completed);
    }

    #[test]
    fn zero_budget_still_moves_one_row() {
        let (_dir, handle) = seeded(3);
        let migration = Migration::new(64, Duration::ZERO);
        let step = migration
            .step(&handle, &MigrationInfo::new("users", "old_users"))
            .unwrap();
        assert_eq!(step, MigrationStep::Progressing { moved: 1 });
    }

    #[test]
    fn rows_move_from_attached_database() {
        let dir = tempdir().unwrap();
        let source_path = dir.path().join("legacy.db");
        let source = Handle::open(&source_path).unwrap();
        source
            .execute_batch(
                "CREATE TABLE messages(id INTEGER PRIMARY KEY, body TEXT);
                 INSERT INTO messages VALUES(1, 'a'), (2, 'b'), (3, 'c');",
            )
            .unwrap();
        source.close().unwrap();

        let handle = Handle::open(&dir.path().join("main.db")).unwrap();
        handle
            .execute_batch("CREATE TABLE messages(id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
        let info = MigrationInfo::new("messages", "messages").with_source_database(&source_path);
        let migration = Migration::new(64, Duration::from_secs(10));

        assert_eq!(
            migration.step(&handle, &info).unwrap(),
            MigrationStep::Progressing { moved: 3 }
        );
        assert_eq!(migration.step(&handle, &info).unwrap(), MigrationStep::Completed);
        assert_eq!(count(&handle, "SELECT count(*) FROM messages"), 3);
        assert!(!is_attached(&handle).unwrap());
    }

    #[test]
    fn failed_step_does_not_leave_its_source_attached() {
        let dir = tempdir().unwrap();
        let legacy = |name: &str, body: &str| {
            let path = dir.path().join(name);
            let handle = Handle::open(&path).unwrap();
            handle
                .execute_batch("CREATE TABLE messages(id INTEGER PRIMARY KEY, body TEXT)")
                .unwrap();
            handle.execute("INSERT INTO messages VALUES(1, ?1)", [body]).unwrap();
            handle.close().unwrap();
            path
        };
        let stale = legacy("x.db", "from_x");
        let wanted = legacy("y.db", "from_y");

        let handle = Handle::open(&dir.path().join("main.db")).unwrap();
        handle
            .execute_batch("CREATE TABLE messages(id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
        let migration = Migration::new(64, Duration::from_secs(10));

        let failed = MigrationInfo::new("absent", "messages").with_source_database(&stale);
        assert!(migration.step(&handle, &failed).is_err());
        assert!(!is_attached(&handle).unwrap());

        let info = MigrationInfo::new("messages", "messages").with_source_database(&wanted);
        while migration.step(&handle, &info).unwrap() != MigrationStep::Completed {}

        let body: String = handle
            .connection()
            .query_row("SELECT body FROM messages WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(body, "from_y");
        let stale = Handle::open(&stale).unwrap();
        assert_eq!(count(&stale, "SELECT count(*) FROM messages"), 1);
        let wanted = Handle::open(&wanted).unwrap();
        assert!(!wanted.table_exists("main", "messages").unwrap());
    }

    #[test]
    fn attached_source_is_replaced_when_the_file_differs() {
        let dir = tempdir().unwrap();
        let other = dir.path().join("other.db");
        Handle::open(&other).unwrap().close().unwrap();
        let (_seeded_dir, handle) = seeded(0);
        handle
            .execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(SOURCE_SCHEMA)),
                [other.to_string_lossy().into_owned()],
            )
            .unwrap();

        let source = dir.path().join("source.db");
        Handle::open(&source).unwrap().close().unwrap();
        let info = MigrationInfo::new("users", "old_users").with_source_database(&source);
        attach_source(&handle, &info).unwrap();

        let attached = attached_file(&handle).unwrap().expect("source attached");
        assert!(same_file(&attached, &source));
    }

    #[test]
    fn missing_target_fails() {
        let (_dir, handle) = seeded(1);
        let error = Migration::new(4, Duration::from_secs(1))
            .step(&handle, &MigrationInfo::new("absent", "old_users"))
            .unwrap_err();
        assert!(matches!(error, CoreError::MigrationFailed { .. }));
        assert_eq!(error.kind(), ErrorKind::Engine);
        assert_eq!(count(&handle, "SELECT count(*) FROM old_users"), 1);
    }
}
