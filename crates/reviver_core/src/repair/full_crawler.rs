//! Recovery of leaf pages no B-tree reaches any more.
//!
//! When an interior page or a root is destroyed, the leaves below it are
//! still in the file but unreachable. After every table has been crawled,
//! the full crawler scans each page that no crawl visited and that is not
//! on the freelist. Table leaves found this way are assigned to one of the
//! tables whose crawl hit corruption, by comparing the shape of their rows
//! against each table's declared columns.
//!
//! Matching uses column affinity as the engine derives it from the
//! declared type. A page is assigned only when one table scores at least
//! [`ORPHAN_SCORE_THRESHOLD`] and strictly better than every other
//! candidate.

use crate::error::CoreResult;
use crate::repair::cell::Cell;
use crate::repair::page::PageType;
use crate::repair::pager::Pager;
use crate::repair::value::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Minimum mean row score for a page to be assigned.
pub const ORPHAN_SCORE_THRESHOLD: f64 = 0.5;

/// Factor applied to rows with fewer values than the table has columns.
const SHORT_ROW_FACTOR: f64 = 0.9;

/// Column affinity derived from a declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// `INT` anywhere in the type.
    Integer,
    /// `CHAR`, `CLOB` or `TEXT`.
    Text,
    /// `BLOB` or no type.
    Blob,
    /// `REAL`, `FLOA` or `DOUB`.
    Real,
    /// Anything else.
    Numeric,
}

impl Affinity {
    /// Applies the engine's affinity rules to a declared column type.
    #[must_use]
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    /// How plausible it is that `value` was stored in a column of this
    /// affinity, in `0.0..=1.0`.
    #[must_use]
    pub fn fitness(self, value: &Value) -> f64 {
        match (self, value) {
            (_, Value::Null) => 1.0,
            (Self::Blob, _) => 0.75,
            (Self::Integer, Value::Integer(_))
            | (Self::Real, Value::Real(_) | Value::Integer(_))
            | (Self::Numeric, Value::Integer(_) | Value::Real(_))
            | (Self::Text, Value::Text(_)) => 1.0,
            (Self::Integer | Self::Numeric, Value::Text(_) | Value::Blob(_))
            | (Self::Real, Value::Text(_) | Value::Blob(_))
            | (Self::Text, Value::Blob(_)) => 0.25,
            _ => 0.0,
        }
    }
}

/// Declared shape of a table whose rows may be found on orphan pages.
#[derive(Debug, Clone, PartialEq)]
pub struct TableShape {
    /// Table name.
    pub name: String,
    /// Affinity of each declared column, in order.
    pub columns: Vec<Affinity>,
}

impl TableShape {
    /// Builds a shape from declared column types.
    pub fn new<'a>(name: impl Into<String>, declared_types: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            name: name.into(),
            columns: declared_types
                .into_iter()
                .map(Affinity::from_declared_type)
                .collect(),
        }
    }

    /// Scores one row against this shape.
    ///
    /// A row with more values than the table has columns cannot belong
    /// to it. The rowid alias column is stored as NULL, which fits any
    /// affinity.
    #[must_use]
    pub fn score(&self, values: &[Value]) -> f64 {
        if values.is_empty() || values.len() > self.columns.len() {
            return 0.0;
        }
        let total: f64 = self
            .columns
            .iter()
            .zip(values)
            .map(|(affinity, value)| affinity.fitness(value))
            .sum();
        let mean = total / values.len() as f64;
        if values.len() < self.columns.len() {
            mean * SHORT_ROW_FACTOR
        } else {
            mean
        }
    }

    /// Scores a page of rows as the mean of its row scores.
    #[must_use]
    pub fn score_cells(&self, cells: &[Cell]) -> f64 {
        if cells.is_empty() {
            return 0.0;
        }
        let total: f64 = cells.iter().map(|cell| self.score(cell.values())).sum();
        total / cells.len() as f64
    }
}

/// An orphan leaf page assigned to a table.
#[derive(Debug, Clone)]
pub struct OrphanPage {
    /// Page number.
    pub page: u32,
    /// Name of the table it was assigned to.
    pub table: String,
    /// Rows decoded from the page.
    pub cells: Vec<Cell>,
    /// Mean row score against the table.
    pub score: f64,
}

/// Scans pages no crawl reached.
#[derive(Debug, Default)]
pub struct FullCrawler {
    scanned: u32,
    unassigned: u32,
}

impl FullCrawler {
    /// Creates a crawler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of table leaves inspected by the last scan.
    #[must_use]
    pub fn scanned(&self) -> u32 {
        self.scanned
    }

    /// Returns the number of table leaves no table matched.
    #[must_use]
    pub fn unassigned(&self) -> u32 {
        self.unassigned
    }

    /// Returns every page after page 1 that is neither in `visited` nor on
    /// the freelist.
    pub fn candidate_pages(pager: &mut Pager, visited: &BTreeSet<u32>) -> Vec<u32> {
        let freelist = pager.freelist_pages();
        (2..=pager.page_count())
            .filter(|page| !visited.contains(page) && !freelist.contains(page))
            .collect()
    }

    /// Picks the table `cells` most plausibly belong to.
    #[must_use]
    pub fn classify<'s>(cells: &[Cell], shapes: &'s [TableShape]) -> Option<(&'s TableShape, f64)> {
        let mut best: Option<(&TableShape, f64)> = None;
        let mut tied = false;
        for shape in shapes {
            let score = shape.score_cells(cells);
            match best {
                Some((_, top)) if (score - top).abs() < f64::EPSILON => tied = true,
                Some((_, top)) if score < top => {}
                _ => {
                    best = Some((shape, score));
                    tied = false;
                }
            }
        }
        match best {
            Some((_, score)) if score < ORPHAN_SCORE_THRESHOLD => None,
            Some(_) if tied => None,
            other => other,
        }
    }

    /// Scans the candidate pages and assigns each table leaf to one of
    /// `shapes`.
    ///
    /// `should_stop` is polled before every page.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Cancelled`] when `should_stop`
    /// returns true.
    pub fn scan(
        &mut self,
        pager: &mut Pager,
        visited: &BTreeSet<u32>,
        shapes: &[TableShape],
        mut should_stop: impl FnMut() -> bool,
    ) -> CoreResult<Vec<OrphanPage>> {
        self.scanned = 0;
        self.unassigned = 0;
        if shapes.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for number in Self::candidate_pages(pager, visited) {
            if should_stop() {
                return Err(crate::error::CoreError::Cancelled);
            }
            // Unreadable candidates are skipped without being marked.
            let Ok(page) = pager.read_page(number) else {
                continue;
            };
            if page.page_type() != PageType::LeafTable {
                continue;
            }
            let Ok(pointers) = page.cell_pointers() else {
                continue;
            };
            let cells: Vec<Cell> = pointers
                .into_iter()
                .filter_map(|offset| Cell::parse(pager, &page, offset).ok())
                .collect();
            if cells.is_empty() {
                continue;
            }
            self.scanned += 1;

            match Self::classify(&cells, shapes) {
                Some((shape, score)) => {
                    debug!(page = number, table = %shape.name, score, "orphan page assigned");
                    found.push(OrphanPage {
                        page: number,
                        table: shape.name.clone(),
                        cells,
                        score,
                    });
                }
                None => self.unassigned += 1,
            }
        }

        info!(
            scanned = self.scanned,
            assigned = found.len(),
            unassigned = self.unassigned,
            "orphan scan finished"
        );
        Ok(found)
    }
}
