//! Writing recovered rows into a fresh database.
//!
//! The repair drivers never write SQL themselves; they hand schema text
//! and rows to an [`Assembler`]. Rows of one table are written inside one
//! transaction that is committed by [`Assembler::mark_as_assembled`] or
//! discarded by [`Assembler::mark_as_failed`], so a table becomes visible
//! in the target only once its crawl is complete.

use crate::error::{CoreError, CoreResult};
use crate::repair::cell::Cell;
use crate::repair::value::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Quotes an identifier for use in SQL text.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A column of a table in the target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, possibly empty.
    pub declared_type: String,
    /// Position in the primary key, zero if not part of it.
    pub primary_key: u32,
}

/// Sink for recovered schema and rows.
pub trait Assembler {
    /// Chooses between keeping the first and the last row of a rowid.
    fn set_duplicated_ignorable(&mut self, ignorable: bool);

    /// Starts assembling `table`, creating it from `sql` if the target
    /// does not have it yet.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the table cannot be created.
    fn assemble_table(&mut self, table: &str, sql: &str) -> CoreResult<()>;

    /// Returns the columns of the table being assembled.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation error when no table is being assembled.
    fn table_columns(&self) -> CoreResult<&[ColumnInfo]>;

    /// Writes one row of the current table.
    ///
    /// Returns false if the target rejected the row by a constraint; the
    /// table stays assemblable.
    ///
    /// # Errors
    ///
    /// Any other engine failure is returned and should fail the table.
    fn assemble_cell(&mut self, cell: &Cell) -> CoreResult<bool>;

    /// Commits the rows written so far and keeps assembling.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the commit fails.
    fn mark_as_milestone(&mut self) -> CoreResult<()>;

    /// Commits the current table.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the commit fails; the rows are then
    /// rolled back.
    fn mark_as_assembled(&mut self) -> CoreResult<()>;

    /// Rolls back the uncommitted rows of the current table.
    fn mark_as_failed(&mut self);

    /// Executes associated schema SQL (indexes, triggers, views).
    ///
    /// # Errors
    ///
    /// Returns an engine error if the statement fails.
    fn assemble_sql(&mut self, sql: &str) -> CoreResult<()>;

    /// Raises the autoincrement sequence of `table` to at least `sequence`.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the sequence table cannot be written.
    fn assemble_sequence(&mut self, table: &str, sequence: i64) -> CoreResult<()>;

    /// Commits pending work and releases the target.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the final commit fails.
    fn finish(&mut self) -> CoreResult<()>;
}

#[derive(Debug)]
struct AssemblingTable {
    name: String,
    columns: Vec<ColumnInfo>,
    rowid_alias: Option<usize>,
    statements: HashMap<usize, String>,
}

impl AssemblingTable {
    fn insert_sql(&mut self, count: usize, ignore_duplicates: bool) -> &str {
        let name = &self.name;
        let columns = &self.columns;
        self.statements.entry(count).or_insert_with(|| {
            let verb = if ignore_duplicates {
                "INSERT OR IGNORE"
            } else {
                "INSERT OR REPLACE"
            };
            let mut sql = format!("{verb} INTO {}(rowid", quote_identifier(name));
            for column in &columns[..count] {
                sql.push_str(", ");
                sql.push_str(&quote_identifier(&column.name));
            }
            sql.push_str(") VALUES(?");
            sql.push_str(&", ?".repeat(count));
            sql.push(')');
            sql
        })
    }
}

/// [`Assembler`] writing into a database file through the bundled engine.
#[derive(Debug)]
pub struct SqliteAssembler {
    path: PathBuf,
    connection: Option<Connection>,
    assembling: Option<AssemblingTable>,
    in_transaction: bool,
    ignore_duplicates: bool,
}

impl SqliteAssembler {
    /// Creates an assembler for the target at `path`. The file is opened
    /// on first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connection: None,
            assembling: None,
            in_transaction: false,
            ignore_duplicates: true,
        }
    }

    /// Returns the target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> CoreResult<&Connection> {
        if self.connection.is_none() {
            let connection = Connection::open(&self.path)?;
            let mode: String = connection.pragma_update_and_check(None, "journal_mode", "DELETE", |row| {
                row.get(0)
            })?;
            debug!(path = %self.path.display(), mode = %mode, "assembler target opened");
            self.connection = Some(connection);
        }
        self.connection
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("assembler target is not open"))
    }

    fn connection(&self) -> CoreResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("assembler target is not open"))
    }

    fn begin(&mut self) -> CoreResult<()> {
        if !self.in_transaction {
            self.open()?.execute_batch("BEGIN IMMEDIATE")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> CoreResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let connection = self.connection()?;
        if let Err(error) = connection.execute_batch("COMMIT") {
            let _ = connection.execute_batch("ROLLBACK");
            return Err(error.into());
        }
        Ok(())
    }

    /// Returns true if the target has a table named `table`.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the schema cannot be queried.
    pub fn table_exists(&mut self, table: &str) -> CoreResult<bool> {
        let found = self
            .open()?
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_columns(&mut self, table: &str) -> CoreResult<Vec<ColumnInfo>> {
        let connection = self.open()?;
        let mut statement =
            connection.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
        let columns = statement
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    primary_key: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

fn rowid_alias(columns: &[ColumnInfo]) -> Option<usize> {
    let mut keys = columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.primary_key > 0);
    match (keys.next(), keys.next()) {
        (Some((index, column)), None) if column.declared_type.eq_ignore_ascii_case("INTEGER") => {
            Some(index)
        }
        _ => None,
    }
}

impl Assembler for SqliteAssembler {
    fn set_duplicated_ignorable(&mut self, ignorable: bool) {
        self.ignore_duplicates = ignorable;
        if let Some(table) = self.assembling.as_mut() {
            table.statements.clear();
        }
    }

    fn assemble_table(&mut self, table: &str, sql: &str) -> CoreResult<()> {
        self.begin()?;
        if !self.table_exists(table)? {
            self.connection()?.execute_batch(sql)?;
        }
        let columns = self.load_columns(table)?;
        let rowid_alias = rowid_alias(&columns);
        debug!(table, columns = columns.len(), "assembling table");
        self.assembling = Some(AssemblingTable {
            name: table.to_string(),
            columns,
            rowid_alias,
            statements: HashMap::new(),
        });
        Ok(())
    }

    fn table_columns(&self) -> CoreResult<&[ColumnInfo]> {
        self.assembling
            .as_ref()
            .map(|table| table.columns.as_slice())
            .ok_or_else(|| CoreError::invalid_operation("no table is being assembled"))
    }

    fn assemble_cell(&mut self, cell: &Cell) -> CoreResult<bool> {
        self.begin()?;
        let ignore_duplicates = self.ignore_duplicates;
        let table = self
            .assembling
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("no table is being assembled"))?;

        let values = cell.values();
        let count = values.len().min(table.columns.len());
        let rowid_alias = table.rowid_alias;
        let sql = table.insert_sql(count, ignore_duplicates).to_string();

        let rowid = Value::Integer(cell.rowid());
        let mut bound: Vec<&Value> = Vec::with_capacity(count + 1);
        bound.push(&rowid);
        for (index, value) in values[..count].iter().enumerate() {
            if Some(index) == rowid_alias && *value == Value::Null {
                bound.push(&rowid);
            } else {
                bound.push(value);
            }
        }

        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("assembler target is not open"))?;
        let mut statement = connection.prepare_cached(&sql)?;
        match statement.execute(params_from_iter(bound)) {
            Ok(changed) => Ok(changed > 0),
            Err(rusqlite::Error::SqliteFailure(error, message))
                if error.code == ErrorCode::ConstraintViolation =>
            {
                debug!(
                    rowid = cell.rowid(),
                    reason = message.as_deref().unwrap_or_default(),
                    "row rejected by constraint"
                );
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn mark_as_milestone(&mut self) -> CoreResult<()> {
        self.commit()
    }

    fn mark_as_assembled(&mut self) -> CoreResult<()> {
        let result = self.commit();
        if let Some(table) = self.assembling.take() {
            match &result {
                Ok(()) => debug!(table = %table.name, "table assembled"),
                Err(error) => warn!(table = %table.name, error = %error, "table commit failed"),
            }
        }
        result
    }

    fn mark_as_failed(&mut self) {
        if self.in_transaction {
            self.in_transaction = false;
            if let Some(connection) = self.connection.as_ref() {
                let _ = connection.execute_batch("ROLLBACK");
            }
        }
        if let Some(table) = self.assembling.take() {
            warn!(table = %table.name, "table assembly rolled back");
        }
    }

    fn assemble_sql(&mut self, sql: &str) -> CoreResult<()> {
        self.commit()?;
        self.open()?.execute_batch(sql)?;
        Ok(())
    }

    fn assemble_sequence(&mut self, table: &str, sequence: i64) -> CoreResult<()> {
        self.commit()?;
        if !self.table_exists("sqlite_sequence")? {
            debug!(table, "target has no sequence table");
            return Ok(());
        }
        let connection = self.connection()?;
        let updated = connection.execute(
            "UPDATE sqlite_sequence SET seq = MAX(seq, ?2) WHERE name = ?1",
            params![table, sequence],
        )?;
        if updated == 0 {
            connection.execute(
                "INSERT INTO sqlite_sequence(name, seq) VALUES(?1, ?2)",
                params![table, sequence],
            )?;
        }
        Ok(())
    }

    fn finish(&mut self) -> CoreResult<()> {
        let result = self.commit();
        self.assembling = None;
        if let Some(connection) = self.connection.take() {
            if let Err((_, error)) = connection.close() {
                warn!(path = %self.path.display(), error = %error, "closing assembler target failed");
            }
        }
        info!(path = %self.path.display(), "assembler finished");
        result
    }
}

impl Drop for SqliteAssembler {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(connection) = self.connection.as_ref() {
                let _ = connection.execute_batch("ROLLBACK");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row_count(path: &Path, table: &str) -> i64 {
        let connection = Connection::open(path).unwrap();
        connection
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("t"), "\"t\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn assembles_rows_with_rowid_alias() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut assembler = SqliteAssembler::new(&path);

        assembler
            .assemble_table("t", "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        assert_eq!(assembler.table_columns().unwrap().len(), 2);
        assert!(assembler
            .assemble_cell(&Cell::new(2, 7, vec![Value::Null, Value::Text(b"a".to_vec())]))
            .unwrap());
        assert!(assembler
            .assemble_cell(&Cell::new(2, 9, vec![Value::Null]))
            .unwrap());
        assembler.mark_as_assembled().unwrap();
        assembler.finish().unwrap();

        let connection = Connection::open(&path).unwrap();
        let id: i64 = connection
            .query_row("SELECT id FROM t WHERE name = 'a'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 7);
        assert_eq!(row_count(&path, "t"), 2);
    }

    #[test]
    fn failed_table_is_rolled_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut assembler = SqliteAssembler::new(&path);

        assembler.assemble_table("t", "CREATE TABLE t(a)").unwrap();
        assembler.mark_as_assembled().unwrap();

        assembler.assemble_table("t", "CREATE TABLE t(a)").unwrap();
        assembler
            .assemble_cell(&Cell::new(2, 1, vec![Value::Integer(1)]))
            .unwrap();
        assembler.mark_as_failed();
        assembler.finish().unwrap();

        assert_eq!(row_count(&path, "t"), 0);
    }

    #[test]
    fn duplicate_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut assembler = SqliteAssembler::new(&path);

        assembler.assemble_table("t", "CREATE TABLE t(a)").unwrap();
        assembler
            .assemble_cell(&Cell::new(2, 1, vec![Value::Integer(1)]))
            .unwrap();
        assembler
            .assemble_cell(&Cell::new(3, 1, vec![Value::Integer(2)]))
            .unwrap();
        assembler.set_duplicated_ignorable(false);
        assembler
            .assemble_cell(&Cell::new(4, 2, vec![Value::Integer(3)]))
            .unwrap();
        assembler
            .assemble_cell(&Cell::new(4, 2, vec![Value::Integer(4)]))
            .unwrap();
        assembler.mark_as_assembled().unwrap();
        assembler.finish().unwrap();

        let connection = Connection::open(&path).unwrap();
        let first: i64 = connection
            .query_row("SELECT a FROM t WHERE rowid = 1", [], |row| row.get(0))
            .unwrap();
        let second: i64 = connection
            .query_row("SELECT a FROM t WHERE rowid = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!((first, second), (1, 4));
    }

    #[test]
    fn constraint_violation_skips_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut assembler = SqliteAssembler::new(&path);

        assembler
            .assemble_table("t", "CREATE TABLE t(a NOT NULL, b)")
            .unwrap();
        assert!(!assembler
            .assemble_cell(&Cell::new(2, 1, vec![Value::Null, Value::Integer(1)]))
            .unwrap());
        assert!(assembler
            .assemble_cell(&Cell::new(2, 2, vec![Value::Integer(1), Value::Null]))
            .unwrap());
        assembler.mark_as_assembled().unwrap();
        assembler.finish().unwrap();
        assert_eq!(row_count(&path, "t"), 1);
    }

    #[test]
    fn sequences_only_grow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut assembler = SqliteAssembler::new(&path);

        assembler
            .assemble_table("t", "CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT)")
            .unwrap();
        assembler.mark_as_assembled().unwrap();
        assembler.assemble_sequence("t", 10).unwrap();
        assembler.assemble_sequence("t", 5).unwrap();
        assembler.finish().unwrap();

        let connection = Connection::open(&path).unwrap();
        let seq: i64 = connection
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = 't'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(seq, 10);
    }
}
