//! Test databases and common scenarios.

use rusqlite::types::Value;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A database file inside its own temporary directory.
pub struct TestDatabase {
    path: PathBuf,
    dir: TempDir,
}

impl TestDatabase {
    /// Creates an empty `test.db` in a fresh directory.
    pub fn new() -> Self {
        Self::named("test.db")
    }

    /// Creates an empty database called `name` in a fresh directory.
    pub fn named(name: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join(name);
        Connection::open(&path).expect("Failed to create database");
        Self { path, dir }
    }

    /// Returns the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the directory holding the database.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Returns a path next to the database, e.g. for a repair target.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Opens a new connection to the database.
    pub fn connection(&self) -> Connection {
        Connection::open(&self.path).expect("Failed to open database")
    }

    /// Runs `sql` on a short-lived connection.
    pub fn execute_batch(&self, sql: &str) {
        self.connection()
            .execute_batch(sql)
            .expect("Failed to execute batch");
    }

    /// Creates `table(id INTEGER PRIMARY KEY, name TEXT, score REAL, payload BLOB)`
    /// holding `rows` rows.
    pub fn create_table(&self, table: &str, rows: usize) {
        let mut connection = self.connection();
        let transaction = connection.transaction().expect("Failed to begin");
        transaction
            .execute_batch(&format!(
                "CREATE TABLE \"{table}\"(id INTEGER PRIMARY KEY, name TEXT, score REAL, payload BLOB)"
            ))
            .expect("Failed to create table");
        {
            let mut insert = transaction
                .prepare(&format!("INSERT INTO \"{table}\"(name, score, payload) VALUES(?1, ?2, ?3)"))
                .expect("Failed to prepare insert");
            for i in 0..rows {
                insert
                    .execute(rusqlite::params![
                        format!("{table}-{i:06}"),
                        i as f64 / 4.0,
                        vec![(i % 251) as u8; i % 17],
                    ])
                    .expect("Failed to insert row");
            }
        }
        transaction.commit().expect("Failed to commit");
    }

    /// Returns the root page of `name`.
    pub fn root_page(&self, name: &str) -> u32 {
        self.connection()
            .query_row(
                "SELECT rootpage FROM sqlite_master WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .expect("Failed to read root page")
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        let size: i64 = self
            .connection()
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .expect("Failed to read page size");
        usize::try_from(size).expect("Negative page size")
    }

    /// Returns the number of pages of the main file.
    pub fn page_count(&self) -> u32 {
        self.connection()
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .expect("Failed to read page count")
    }

    /// Returns the names of the user tables in name order.
    pub fn tables(&self) -> Vec<String> {
        table_names(&self.path)
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the number of rows of `table` in the database at `path`.
pub fn count_rows(path: &Path, table: &str) -> i64 {
    Connection::open(path)
        .expect("Failed to open database")
        .query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("Failed to count rows")
}

/// Returns the user tables of the database at `path` in name order.
pub fn table_names(path: &Path) -> Vec<String> {
    let connection = Connection::open(path).expect("Failed to open database");
    let mut statement = connection
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .expect("Failed to prepare");
    let names = statement
        .query_map([], |row| row.get(0))
        .expect("Failed to list tables")
        .collect::<Result<Vec<String>, _>>()
        .expect("Failed to read table name");
    names
}

/// Returns every row of `table` with its rowid, in rowid order.
pub fn dump_table(path: &Path, table: &str) -> Vec<Vec<Value>> {
    let connection = Connection::open(path).expect("Failed to open database");
    let mut statement = connection
        .prepare(&format!("SELECT rowid, * FROM \"{table}\" ORDER BY rowid"))
        .expect("Failed to prepare dump");
    let width = statement.column_count();
    let rows = statement
        .query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect())
        .expect("Failed to dump table")
        .collect::<Result<Vec<Vec<Value>>, _>>()
        .expect("Failed to read row");
    rows
}

/// Prebuilt databases.
pub mod scenarios {
    use super::*;

    /// Creates `count` tables `t_00`, `t_01`, ... with `rows` rows each.
    pub fn many_tables(count: usize, rows: usize) -> TestDatabase {
        let database = TestDatabase::new();
        for i in 0..count {
            database.create_table(&format!("t_{i:02}"), rows);
        }
        database
    }

    /// Creates one `users` table large enough to need interior pages.
    pub fn large_table(rows: usize) -> TestDatabase {
        let database = TestDatabase::new();
        database.create_table("users", rows);
        database.execute_batch("CREATE INDEX users_name ON users(name)");
        database
    }
}
