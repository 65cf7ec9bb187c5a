//! Schema entries read from `sqlite_master`.

use crate::repair::cell::Cell;
use crate::repair::value::Value;

/// Root page of `sqlite_master`.
pub const MASTER_ROOT_PAGE: u32 = 1;

/// Name of the autoincrement sequence table.
pub const SEQUENCE_TABLE: &str = "sqlite_sequence";

/// Returns true for names the engine reserves for itself.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    name.len() >= 7 && name[..7].eq_ignore_ascii_case("sqlite_")
}

/// Kind of a schema object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKind {
    /// A table.
    Table,
    /// An index.
    Index,
    /// A view.
    View,
    /// A trigger.
    Trigger,
    /// Anything else, kept verbatim.
    Other(String),
}

impl MasterKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "table" => Self::Table,
            "index" => Self::Index,
            "view" => Self::View,
            "trigger" => Self::Trigger,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One row of `sqlite_master`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterItem {
    /// Object kind.
    pub kind: MasterKind,
    /// Object name.
    pub name: String,
    /// Table the object belongs to.
    pub table_name: String,
    /// Root page; zero for views, triggers and virtual tables.
    pub root_page: u32,
    /// Defining SQL; absent for automatic indexes.
    pub sql: Option<String>,
}

impl MasterItem {
    /// Builds an item from a crawled `sqlite_master` cell.
    ///
    /// Returns `None` when the row is too damaged to name an object.
    #[must_use]
    pub fn from_cell(cell: &Cell) -> Option<Self> {
        let values = cell.values();
        let text = |index: usize| values.get(index).and_then(Value::as_text).map(str::to_string);

        let kind = MasterKind::parse(&text(0)?);
        let name = text(1)?;
        let table_name = text(2).unwrap_or_else(|| name.clone());
        let root_page = values
            .get(3)
            .and_then(Value::as_integer)
            .and_then(|page| u32::try_from(page).ok())
            .unwrap_or(0);
        let sql = text(4);

        Some(Self {
            kind,
            name,
            table_name,
            root_page,
            sql,
        })
    }

    /// Returns true for tables.
    #[must_use]
    pub fn is_table(&self) -> bool {
        self.kind == MasterKind::Table
    }

    /// Returns true for engine-owned objects.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        is_reserved_name(&self.name)
    }

    /// Returns true for tables stored as index B-trees.
    #[must_use]
    pub fn is_without_rowid(&self) -> bool {
        self.sql
            .as_deref()
            .is_some_and(|sql| sql.to_ascii_uppercase().contains("WITHOUT ROWID"))
    }

    /// Returns true for virtual tables.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.sql.as_deref().is_some_and(|sql| {
            sql.trim_start()
                .to_ascii_uppercase()
                .starts_with("CREATE VIRTUAL")
        })
    }

    /// Returns true for rowid tables whose rows can be crawled.
    #[must_use]
    pub fn is_crawlable_table(&self) -> bool {
        self.is_table()
            && !self.is_reserved()
            && self.root_page > 0
            && !self.is_without_rowid()
            && !self.is_virtual()
            && self.sql.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name("sqlite_sequence"));
        assert!(is_reserved_name("SQLITE_stat1"));
        assert!(!is_reserved_name("sqlite"));
        assert!(!is_reserved_name("users"));
    }

    #[test]
    fn crawlable_tables() {
        let item = MasterItem {
            kind: MasterKind::Table,
            name: "t".into(),
            table_name: "t".into(),
            root_page: 2,
            sql: Some("CREATE TABLE t(a PRIMARY KEY) without rowid".into()),
        };
        assert!(item.is_without_rowid());
        assert!(!item.is_crawlable_table());

        let item = MasterItem {
            sql: Some("CREATE TABLE t(a)".into()),
            ..item
        };
        assert!(item.is_crawlable_table());
    }
}
