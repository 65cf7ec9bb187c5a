//! A connection to one database file.

use crate::error::{CoreError, CoreResult};
use crate::repair::quote_identifier;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Params};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Checkpoint modes of the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Copy what can be copied without waiting.
    Passive,
    /// Wait for writers, then copy everything.
    Full,
    /// Like `Full`, then wait for readers to leave the WAL.
    Restart,
    /// Like `Restart`, then truncate the WAL file.
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// Result row of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// True if the checkpoint could not complete because of a lock.
    pub busy: bool,
    /// Frames in the WAL, or -1 outside WAL mode.
    pub log_frames: i64,
    /// Frames copied back, or -1 outside WAL mode.
    pub checkpointed_frames: i64,
}

/// An open connection.
#[derive(Debug)]
pub struct Handle {
    path: PathBuf,
    connection: Connection,
}

impl Handle {
    /// Opens `path` for reading and writing, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the file cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!(path = %path.display(), "handle opened");
        Ok(Self {
            path: path.to_path_buf(),
            connection,
        })
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the underlying connection for queries.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Executes one statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> CoreResult<usize> {
        trace!(path = %self.path.display(), sql, "execute");
        Ok(self.connection.execute(sql, params)?)
    }

    /// Executes a batch of statements.
    ///
    /// # Errors
    ///
    /// Returns the engine error of the first failing statement.
    pub fn execute_batch(&self, sql: &str) -> CoreResult<()> {
        trace!(path = %self.path.display(), sql, "execute batch");
        Ok(self.connection.execute_batch(sql)?)
    }

    /// Returns true while a transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        !self.connection.is_autocommit()
    }

    /// Rolls back an open transaction. Returns true if one was open.
    ///
    /// # Errors
    ///
    /// Returns the engine error of the rollback.
    pub fn rollback_if_needed(&self) -> CoreResult<bool> {
        if !self.is_in_transaction() {
            return Ok(false);
        }
        self.connection.execute_batch("ROLLBACK")?;
        debug!(path = %self.path.display(), "open transaction rolled back");
        Ok(true)
    }

    /// Checkpoints the WAL of the main schema.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn checkpoint(&self, mode: CheckpointMode) -> CoreResult<Checkpoint> {
        let sql = format!("PRAGMA main.wal_checkpoint({})", mode.as_sql());
        let checkpoint = self.connection.query_row(&sql, [], |row| {
            Ok(Checkpoint {
                busy: row.get::<_, i64>(0)? != 0,
                log_frames: row.get(1)?,
                checkpointed_frames: row.get(2)?,
            })
        })?;
        debug!(
            path = %self.path.display(),
            mode = mode.as_sql(),
            busy = checkpoint.busy,
            frames = checkpoint.log_frames,
            "checkpointed"
        );
        Ok(checkpoint)
    }

    /// Returns true if `schema` has a table named `table`.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn table_exists(&self, schema: &str, table: &str) -> CoreResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            quote_identifier(schema)
        );
        let found = self
            .connection
            .query_row(&sql, [table], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns the column names of `schema.table` in declaration order.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn column_names(&self, schema: &str, table: &str) -> CoreResult<Vec<String>> {
        let sql = format!(
            "PRAGMA {}.table_info({})",
            quote_identifier(schema),
            quote_identifier(table)
        );
        let mut statement = self.connection.prepare(&sql)?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Returns the journal mode of the main schema.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn journal_mode(&self) -> CoreResult<String> {
        Ok(self
            .connection
            .query_row("PRAGMA main.journal_mode", [], |row| row.get(0))?)
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the engine error if statements are still unfinalized.
    pub fn close(self) -> CoreResult<()> {
        let path = self.path;
        self.connection
            .close()
            .map_err(|(_, error)| CoreError::Engine(error))?;
        debug!(path = %path.display(), "handle closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn schema_queries() {
        let dir = tempdir().unwrap();
        let handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle
            .execute_batch("CREATE TABLE \"odd name\"(a, \"b c\", d)")
            .unwrap();

        assert!(handle.table_exists("main", "odd name").unwrap());
        assert!(!handle.table_exists("main", "missing").unwrap());
        assert_eq!(
            handle.column_names("main", "odd name").unwrap(),
            vec!["a", "b c", "d"]
        );
    }

    #[test]
    fn rollback_only_when_needed() {
        let dir = tempdir().unwrap();
        let handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle.execute_batch("CREATE TABLE t(a)").unwrap();
        assert!(!handle.rollback_if_needed().unwrap());

        handle.execute_batch("BEGIN; INSERT INTO t VALUES(1);").unwrap();
        assert!(handle.is_in_transaction());
        assert!(handle.rollback_if_needed().unwrap());
        let count: i64 = handle
            .connection()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn checkpoint_in_wal_mode() {
        let dir = tempdir().unwrap();
        let handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle
            .execute_batch("PRAGMA journal_mode=WAL; CREATE TABLE t(a); INSERT INTO t VALUES(1);")
            .unwrap();
        assert_eq!(handle.journal_mode().unwrap(), "wal");

        let checkpoint = handle.checkpoint(CheckpointMode::Passive).unwrap();
        assert!(!checkpoint.busy);
        assert_eq!(checkpoint.log_frames, checkpoint.checkpointed_frames);
        handle.close().unwrap();
    }
}
