//! Completeness scoring of a repair.
//!
//! Each table gets a sub-score in `0.0..=1.0`: the share of its B-tree
//! pages that could be read, times the share of declared columns that
//! were decoded across its rows. The overall score is the mean of the
//! sub-scores weighted by each table's column count. Scores are advisory
//! and never decide whether rows are written.

use serde::Serialize;
use std::collections::BTreeMap;

/// Counters of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableEvaluation {
    /// Declared column count, used as the table's weight.
    pub columns: usize,
    /// B-tree pages read successfully.
    pub ok_pages: u32,
    /// B-tree pages lost.
    pub corrupted_pages: u32,
    /// Rows handed to the assembler.
    pub rows: u64,
    /// Column values decoded.
    pub decoded_columns: u64,
    /// Column values the rows declared.
    pub expected_columns: u64,
    /// Whether the table's rows were committed.
    pub recovered: bool,
}

impl TableEvaluation {
    /// Returns true if the table was committed with at least one readable
    /// page behind it.
    #[must_use]
    pub fn holds_data(&self) -> bool {
        self.recovered && self.ok_pages > 0
    }

    /// Returns the table's sub-score.
    #[must_use]
    pub fn score(&self) -> f64 {
        if !self.recovered {
            return 0.0;
        }
        let pages = self.ok_pages + self.corrupted_pages;
        let page_factor = if pages == 0 {
            1.0
        } else {
            f64::from(self.ok_pages) / f64::from(pages)
        };
        let column_factor = if self.expected_columns == 0 {
            1.0
        } else {
            self.decoded_columns as f64 / self.expected_columns as f64
        };
        page_factor * column_factor
    }
}

/// Scores of every table of a repair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    tables: BTreeMap<String, TableEvaluation>,
}

impl Evaluation {
    /// Creates an empty evaluation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table with its declared column count.
    pub fn add_table(&mut self, table: &str, columns: usize) {
        self.tables.entry(table.to_string()).or_default().columns = columns;
    }

    /// Returns the counters of `table`, creating them if needed.
    pub fn table_mut(&mut self, table: &str) -> &mut TableEvaluation {
        self.tables.entry(table.to_string()).or_default()
    }

    /// Returns the counters of `table`.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&TableEvaluation> {
        self.tables.get(table)
    }

    /// Iterates over all tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableEvaluation)> {
        self.tables.iter().map(|(name, table)| (name.as_str(), table))
    }

    /// Counts a readable page of `table`.
    pub fn record_page(&mut self, table: &str) {
        self.table_mut(table).ok_pages += 1;
    }

    /// Counts a lost page of `table`.
    pub fn record_corrupted_page(&mut self, table: &str) {
        self.table_mut(table).corrupted_pages += 1;
    }

    /// Counts one row of `table` with its decoded and declared columns.
    pub fn record_row(&mut self, table: &str, decoded: usize, declared: usize) {
        let entry = self.table_mut(table);
        entry.rows += 1;
        entry.decoded_columns += decoded as u64;
        entry.expected_columns += declared as u64;
    }

    /// Sets whether the rows of `table` were committed.
    pub fn set_recovered(&mut self, table: &str, recovered: bool) {
        self.table_mut(table).recovered = recovered;
    }

    /// Returns the number of committed tables with at least one readable
    /// page.
    #[must_use]
    pub fn recovered_tables(&self) -> usize {
        self.tables.values().filter(|table| table.holds_data()).count()
    }

    /// Returns the column-weighted mean of all sub-scores.
    #[must_use]
    pub fn score(&self) -> f64 {
        let (weighted, weight) = self
            .tables
            .values()
            .fold((0.0, 0.0), |(weighted, weight), table| {
                let w = table.columns.max(1) as f64;
                (weighted + table.score() * w, weight + w)
            });
        if weight == 0.0 {
            0.0
        } else {
            weighted / weight
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_evaluation_scores_zero() {
        assert_eq!(Evaluation::new().score(), 0.0);
    }

    #[test]
    fn sub_score_combines_pages_and_columns() {
        let mut evaluation = Evaluation::new();
        evaluation.add_table("t", 4);
        evaluation.record_page("t");
        evaluation.record_page("t");
        evaluation.record_page("t");
        evaluation.record_corrupted_page("t");
        evaluation.record_row("t", 4, 4);
        evaluation.record_row("t", 2, 4);
        evaluation.set_recovered("t", true);

        let score = evaluation.table("t").unwrap().score();
        assert!((score - 0.75 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn overall_score_is_weighted_by_columns() {
        let mut evaluation = Evaluation::new();
        evaluation.add_table("wide", 9);
        evaluation.record_page("wide");
        evaluation.set_recovered("wide", true);
        evaluation.add_table("narrow", 1);
        evaluation.set_recovered("narrow", false);

        assert!((evaluation.score() - 0.9).abs() < 1e-9);
        assert_eq!(evaluation.recovered_tables(), 1);
    }

    #[test]
    fn committed_table_without_pages_holds_no_data() {
        let mut evaluation = Evaluation::new();
        evaluation.add_table("empty_root", 2);
        evaluation.table_mut("empty_root").corrupted_pages += 1;
        evaluation.set_recovered("empty_root", true);

        assert!(!evaluation.table("empty_root").unwrap().holds_data());
        assert_eq!(evaluation.recovered_tables(), 0);
    }

    #[test]
    fn unrecovered_table_scores_zero() {
        let mut evaluation = Evaluation::new();
        evaluation.add_table("t", 2);
        evaluation.record_page("t");
        assert_eq!(evaluation.table("t").unwrap().score(), 0.0);
    }
}
