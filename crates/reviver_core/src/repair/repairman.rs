//! The repair driver.
//!
//! A [`Repairman`] copies every row it can still find in a damaged source
//! database into a fresh target. With a material from an earlier backup
//! it first runs the [`Mechanic`] over the recorded leaf pages, keeping
//! the last copy of each row. It then crawls the live B-trees from
//! `sqlite_master`, keeping rows the material already produced. Tables
//! whose crawl lost pages are finally matched against unreachable leaf
//! pages. Indexes, triggers and views are created after all rows, then
//! autoincrement sequences are restored.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::config::RepairConfig;
use crate::lock::{HandleReadLocker, Locker, PathLockRegistry, ProcessReadLocker};
use crate::progress::Progress;
use crate::repair::assembler::{Assembler, ColumnInfo, SqliteAssembler};
use crate::repair::cell::Cell;
use crate::repair::crawler::{Crawlable, CrawlerDelegate, MasterCrawler, SequenceCrawler};
use crate::repair::evaluation::Evaluation;
use crate::repair::full_crawler::{FullCrawler, OrphanPage, TableShape};
use crate::repair::master::{MasterItem, MasterKind, SEQUENCE_TABLE};
use crate::repair::material::Material;
use crate::repair::mechanic::Mechanic;
use crate::repair::page::Page;
use crate::repair::pager::{sibling, Pager, PagerOptions};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure that ended a repair session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Rendered message.
    pub message: String,
}

impl From<&CoreError> for RepairError {
    fn from(error: &CoreError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of a repair session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairResult {
    /// Tables committed to the target with at least one readable page.
    pub recovered_table_count: usize,
    /// Completeness estimate in `0.0..=1.0`.
    pub score: f64,
    /// Set when the session stopped early.
    pub error: Option<RepairError>,
    /// Per-table counters behind `score`.
    pub evaluation: Evaluation,
}

impl RepairResult {
    fn failed(error: &CoreError) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Returns true if the session ran to completion.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Hands one row to the assembler and accounts for it.
pub(crate) fn assemble_row(
    assembler: &mut dyn Assembler,
    evaluation: &mut Evaluation,
    table: &str,
    columns: usize,
    cell: &Cell,
) -> CoreResult<()> {
    let accepted = assembler.assemble_cell(cell)?;
    let declared = cell.declared_columns().min(columns);
    let decoded = if accepted {
        cell.values().len().min(declared)
    } else {
        0
    };
    evaluation.record_row(table, decoded, declared);
    Ok(())
}

struct TableCrawler<'a> {
    table: &'a str,
    columns: usize,
    assembler: &'a mut dyn Assembler,
    evaluation: &'a mut Evaluation,
    progress: &'a mut Progress,
}

impl CrawlerDelegate for TableCrawler<'_> {
    fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()> {
        assemble_row(&mut *self.assembler, self.evaluation, self.table, self.columns, &cell)
    }

    fn on_page_crawled(&mut self, _page: &Page) {
        self.progress.increase(1);
    }

    fn on_crawler_error(&mut self, page: u32, error: &CoreError) {
        warn!(table = self.table, page, error = %error, "lost data while crawling");
    }

    fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }
}

#[derive(Debug)]
struct DamagedTable {
    name: String,
    sql: String,
    columns: Vec<ColumnInfo>,
}

/// Repairs one source database into one target.
#[derive(Debug)]
pub struct Repairman {
    source: PathBuf,
    target: PathBuf,
    config: RepairConfig,
    registry: Arc<PathLockRegistry>,
    lock_timeout: Duration,
    progress: Progress,
}

impl Repairman {
    /// Creates a repair of `source` into `target` with default options.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            config: RepairConfig::default(),
            registry: Arc::new(PathLockRegistry::new()),
            lock_timeout: Duration::from_secs(10),
            progress: Progress::new(),
        }
    }

    /// Sets the session options.
    #[must_use]
    pub fn with_config(mut self, config: RepairConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares the in-process lock registry of the caller.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PathLockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets how long to wait for the source read lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Reports progress and honors cancellation through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the source path.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Returns the target path.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Runs the repair.
    ///
    /// Failures are reported in [`RepairResult::error`]; tables committed
    /// before a failure stay in the target.
    pub fn work(&mut self) -> RepairResult {
        info!(source = %self.source.display(), target = %self.target.display(), "repair started");
        match self.run() {
            Ok(result) => {
                info!(
                    source = %self.source.display(),
                    tables = result.recovered_table_count,
                    score = result.score,
                    "repair finished"
                );
                result
            }
            Err(error) => {
                warn!(source = %self.source.display(), error = %error, "repair failed");
                RepairResult::failed(&error)
            }
        }
    }

    fn run(&mut self) -> CoreResult<RepairResult> {
        if same_file(&self.source, &self.target) {
            return Err(CoreError::invalid_operation("repair target is the source"));
        }

        let mut process_lock =
            ProcessReadLocker::new(Arc::clone(&self.registry), &self.source, self.lock_timeout);
        process_lock.acquire()?;
        let mut engine_lock = HandleReadLocker::new(&self.source, self.lock_timeout);
        if let Err(error) = engine_lock.acquire() {
            if error.kind() == ErrorKind::Lock {
                return Err(error);
            }
            warn!(path = %self.source.display(), error = %error, "engine cannot read source, reading raw pages only");
        }

        remove_target(&self.target)?;
        let options = PagerOptions {
            use_wal: self.config.use_wal,
            ..PagerOptions::default()
        };
        let mut pager = Pager::open(&self.source, &options)?;

        let material = self.load_material();
        let material_pages = material.as_ref().map_or(0, |m| m.page_count() as u64);
        self.progress
            .set_total(u64::from(pager.page_count()) + material_pages);

        let mut assembler = SqliteAssembler::new(&self.target);
        let mechanic = match &material {
            Some(material) => Some(self.run_mechanic(material, &options, &mut assembler)?),
            None => None,
        };

        assembler.set_duplicated_ignorable(material.is_some() || self.config.ignore_duplicates);
        let mut crawlable = Crawlable::new(&mut pager);
        let (items, crawled) = self.crawl(&mut crawlable, &mut assembler)?;

        let mut associated: Vec<&str> = Vec::new();
        if let (Some(material), Some(evaluation)) = (&material, &mechanic) {
            associated.extend(Mechanic::associated_sqls(material, evaluation));
        }
        associated.extend(associated_sqls(&items, &crawled));
        assemble_associated(&mut assembler, associated);
        self.assemble_sequences(&mut crawlable, &mut assembler, &items, &crawled)?;

        assembler.finish()?;
        if let Err(error) = engine_lock.release() {
            debug!(error = %error, "releasing engine read lock failed");
        }
        process_lock.release()?;

        let recovered: BTreeSet<&str> = crawled
            .tables()
            .chain(mechanic.iter().flat_map(Evaluation::tables))
            .filter(|(_, table)| table.holds_data())
            .map(|(name, _)| name)
            .collect();
        let recovered_table_count = recovered.len();
        let evaluation = match mechanic {
            Some(mechanic) if mechanic.score() > crawled.score() => mechanic,
            _ => crawled,
        };
        let score = evaluation.score();
        self.progress.set_score(score);
        self.progress.finish();
        Ok(RepairResult {
            recovered_table_count,
            score,
            error: None,
            evaluation,
        })
    }

    fn load_material(&self) -> Option<Material> {
        if !self.config.use_material {
            return None;
        }
        match Material::load(&self.source, self.config.material_key.as_ref()) {
            Ok(material) => material,
            Err(error) => {
                warn!(path = %self.source.display(), error = %error, "material unusable, crawling only");
                None
            }
        }
    }

    fn run_mechanic(
        &mut self,
        material: &Material,
        options: &PagerOptions,
        assembler: &mut SqliteAssembler,
    ) -> CoreResult<Evaluation> {
        let mut pager = Pager::open(&self.source, options)?;
        let mut evaluation = Evaluation::new();
        assembler.set_duplicated_ignorable(false);
        match Mechanic::new(material).work(&mut pager, assembler, &mut evaluation, &mut self.progress) {
            Ok(()) => {}
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(error) => warn!(error = %error, "material repair stopped early"),
        }
        info!(
            tables = evaluation.recovered_tables(),
            score = evaluation.score(),
            "material repair done"
        );
        self.progress.set_score(evaluation.score());
        Ok(evaluation)
    }

    fn crawl(
        &mut self,
        crawlable: &mut Crawlable<'_>,
        assembler: &mut SqliteAssembler,
    ) -> CoreResult<(Vec<MasterItem>, Evaluation)> {
        let mut evaluation = Evaluation::new();
        let (items, master) = MasterCrawler::work(crawlable)?;
        self.progress.increase(u64::from(master.pages));
        if master.hit_corruption() {
            warn!(corrupted_pages = master.corrupted_pages, "schema table is damaged");
        }

        let mut damaged = Vec::new();
        for item in items.iter().filter(|item| item.is_table() && !item.is_reserved()) {
            self.progress.check_cancelled()?;
            if !item.is_crawlable_table() {
                warn!(table = %item.name, "table has no rowid B-tree, skipped");
                continue;
            }
            match self.crawl_table(crawlable, assembler, &mut evaluation, item) {
                Ok(Some(table)) => damaged.push(table),
                Ok(None) => {}
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(error) => warn!(table = %item.name, error = %error, "table not recovered"),
            }
        }

        if self.config.full_crawl_fallback && !damaged.is_empty() {
            self.adopt_orphans(crawlable, assembler, &mut evaluation, &damaged)?;
        }
        Ok((items, evaluation))
    }

    /// Crawls one table and returns it when pages or rows were lost.
    fn crawl_table(
        &mut self,
        crawlable: &mut Crawlable<'_>,
        assembler: &mut SqliteAssembler,
        evaluation: &mut Evaluation,
        item: &MasterItem,
    ) -> CoreResult<Option<DamagedTable>> {
        let table = item.name.as_str();
        let sql = item.sql.as_deref().unwrap_or_default();
        evaluation.set_recovered(table, false);
        if let Err(error) = assembler.assemble_table(table, sql) {
            assembler.mark_as_failed();
            return Err(error);
        }
        let columns = assembler.table_columns()?.to_vec();
        evaluation.add_table(table, columns.len());

        let mut delegate = TableCrawler {
            table,
            columns: columns.len(),
            assembler: &mut *assembler,
            evaluation: &mut *evaluation,
            progress: &mut self.progress,
        };
        let stats = match crawlable.crawl(item.root_page, &mut delegate) {
            Ok(stats) => stats,
            Err(error) => {
                assembler.mark_as_failed();
                return Err(error);
            }
        };

        let counters = evaluation.table_mut(table);
        counters.ok_pages += stats.pages;
        counters.corrupted_pages += stats.corrupted_pages;
        for _ in 0..stats.corrupted_cells {
            evaluation.record_row(table, 0, columns.len());
        }
        assembler.mark_as_assembled()?;
        evaluation.set_recovered(table, true);
        debug!(
            table,
            rows = stats.cells,
            pages = stats.pages,
            corrupted_pages = stats.corrupted_pages,
            "table crawled"
        );

        Ok(stats.hit_corruption().then(|| DamagedTable {
            name: table.to_string(),
            sql: sql.to_string(),
            columns,
        }))
    }

    fn adopt_orphans(
        &mut self,
        crawlable: &mut Crawlable<'_>,
        assembler: &mut SqliteAssembler,
        evaluation: &mut Evaluation,
        damaged: &[DamagedTable],
    ) -> CoreResult<()> {
        let visited = crawlable.visited().clone();
        let shapes: Vec<TableShape> = damaged
            .iter()
            .map(|table| {
                TableShape::new(
                    table.name.clone(),
                    table.columns.iter().map(|column| column.declared_type.as_str()),
                )
            })
            .collect();

        let mut scanner = FullCrawler::new();
        let progress = &self.progress;
        let orphans = scanner.scan(crawlable.pager(), &visited, &shapes, || progress.is_cancelled())?;
        info!(
            scanned = scanner.scanned(),
            assigned = orphans.len(),
            unassigned = scanner.unassigned(),
            "unreachable pages scanned"
        );

        let mut by_table: BTreeMap<String, Vec<OrphanPage>> = BTreeMap::new();
        for orphan in orphans {
            by_table.entry(orphan.table.clone()).or_default().push(orphan);
        }
        for table in damaged {
            let Some(pages) = by_table.remove(&table.name) else {
                continue;
            };
            if let Err(error) = assembler.assemble_table(&table.name, &table.sql) {
                warn!(table = %table.name, error = %error, "orphan rows not assembled");
                assembler.mark_as_failed();
                continue;
            }
            let columns = table.columns.len();
            let mut adopt = || -> CoreResult<()> {
                for orphan in &pages {
                    for cell in &orphan.cells {
                        assemble_row(&mut *assembler, evaluation, &table.name, columns, cell)?;
                    }
                    evaluation.record_page(&table.name);
                }
                Ok(())
            };
            match adopt().and_then(|()| assembler.mark_as_assembled()) {
                Ok(()) => info!(table = %table.name, pages = pages.len(), "orphan pages adopted"),
                Err(error) => {
                    warn!(table = %table.name, error = %error, "orphan rows rolled back");
                    assembler.mark_as_failed();
                }
            }
        }
        Ok(())
    }

    fn assemble_sequences(
        &mut self,
        crawlable: &mut Crawlable<'_>,
        assembler: &mut SqliteAssembler,
        items: &[MasterItem],
        evaluation: &Evaluation,
    ) -> CoreResult<()> {
        let root = items
            .iter()
            .find(|item| item.is_table() && item.name == SEQUENCE_TABLE)
            .map_or(0, |item| item.root_page);
        if root == 0 {
            return Ok(());
        }
        for (table, sequence) in SequenceCrawler::work(crawlable, root)? {
            if !evaluation.table(&table).is_some_and(|t| t.recovered) {
                continue;
            }
            if let Err(error) = assembler.assemble_sequence(&table, sequence) {
                warn!(table = %table, sequence, error = %error, "sequence not restored");
            }
        }
        Ok(())
    }
}

fn associated_sqls<'i>(items: &'i [MasterItem], evaluation: &'i Evaluation) -> impl Iterator<Item = &'i str> {
    items
        .iter()
        .filter(|item| !item.is_table() && !item.is_reserved())
        .filter(move |item| {
            item.kind == MasterKind::View
                || evaluation.table(&item.table_name).is_some_and(|t| t.recovered)
        })
        .filter_map(|item| item.sql.as_deref())
}

fn assemble_associated<'s>(assembler: &mut dyn Assembler, sqls: impl IntoIterator<Item = &'s str>) {
    let mut done = BTreeSet::new();
    for sql in sqls {
        if !done.insert(sql) {
            continue;
        }
        if let Err(error) = assembler.assemble_sql(sql) {
            debug!(sql, error = %error, "associated SQL skipped");
        }
    }
}

fn same_file(source: &Path, target: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(target)) {
        (Ok(source), Ok(target)) => source == target,
        _ => source == target,
    }
}

fn remove_target(target: &Path) -> CoreResult<()> {
    for path in [
        target.to_path_buf(),
        sibling(target, "-wal"),
        sibling(target, "-shm"),
        sibling(target, "-journal"),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "stale target file removed"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::BackupHandle;
    use crate::progress::Cancellation;
    use crate::repair::backup::Backup;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn populate(path: &Path, rows: usize) {
        let connection = Connection::open(path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE users(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, age INTEGER);
                 CREATE INDEX users_name ON users(name);
                 CREATE VIEW adults AS SELECT * FROM users WHERE age >= 18;
                 CREATE TABLE tags(label TEXT);
                 INSERT INTO tags VALUES('a'), ('b');",
            )
            .unwrap();
        let mut insert = connection
            .prepare("INSERT INTO users(name, age) VALUES(?1, ?2)")
            .unwrap();
        for i in 0..rows {
            insert.execute(rusqlite::params![format!("user-{i:05}"), i as i64 % 90]).unwrap();
        }
    }

    fn root_page(path: &Path, table: &str) -> u32 {
        Connection::open(path)
            .unwrap()
            .query_row("SELECT rootpage FROM sqlite_master WHERE name = ?1", [table], |row| {
                row.get(0)
            })
            .unwrap()
    }

    fn zero_page(path: &Path, page: u32) {
        let mut data = fs::read(path).unwrap();
        let size = usize::from(u16::from_be_bytes([data[16], data[17]]));
        let start = (page as usize - 1) * size;
        data[start..start + size].fill(0);
        fs::write(path, data).unwrap();
    }

    fn count(path: &Path, table: &str) -> i64 {
        Connection::open(path)
            .unwrap()
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn healthy_database_is_copied_completely() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let target = dir.path().join("target.db");
        populate(&source, 500);

        let result = Repairman::new(&source, &target).work();

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.recovered_table_count, 2);
        assert!((result.score - 1.0).abs() < 1e-9);
        assert_eq!(count(&target, "users"), 500);
        assert_eq!(count(&target, "tags"), 2);
        assert_eq!(count(&target, "adults"), count(&source, "adults"));

        let connection = Connection::open(&target).unwrap();
        let sequence: i64 = connection
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = 'users'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sequence, 500);
        let index: i64 = connection
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = 'users_name'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn lost_root_lowers_score_but_keeps_other_tables() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let target = dir.path().join("target.db");
        populate(&source, 2000);
        zero_page(&source, root_page(&source, "users"));

        let result = Repairman::new(&source, &target)
            .with_config(RepairConfig::new().full_crawl_fallback(false))
            .work();

        assert!(result.is_success());
        assert!(result.score < 1.0);
        assert_eq!(count(&target, "tags"), 2);
        assert_eq!(count(&target, "users"), 0);
        assert_eq!(result.evaluation.table("users").unwrap().corrupted_pages, 1);
    }

    #[test]
    fn orphan_leaves_are_adopted_after_root_loss() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let target = dir.path().join("target.db");
        populate(&source, 2000);
        zero_page(&source, root_page(&source, "users"));

        let result = Repairman::new(&source, &target).work();

        assert!(result.is_success());
        assert!(count(&target, "users") > 1000);
        assert!(result.evaluation.table("users").unwrap().ok_pages > 0);
    }

    #[test]
    fn material_recovers_rows_behind_destroyed_root() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let target = dir.path().join("target.db");
        populate(&source, 2000);

        let registry = Arc::new(PathLockRegistry::new());
        let mut lock = BackupHandle::for_path(&registry, &source, Duration::from_secs(1));
        Backup::new(&source).save(&mut lock).unwrap();
        zero_page(&source, root_page(&source, "users"));

        let result = Repairman::new(&source, &target)
            .with_registry(registry)
            .with_config(RepairConfig::new().full_crawl_fallback(false))
            .work();

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(count(&target, "users"), 2000);
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_source_reports_format_error() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("garbage.db");
        fs::write(&source, vec![0x11; 4096]).unwrap();

        let result = Repairman::new(&source, dir.path().join("target.db")).work();

        assert_eq!(result.error.unwrap().kind, ErrorKind::Format);
        assert_eq!(result.recovered_table_count, 0);
    }

    #[test]
    fn held_write_lock_fails_with_lock_error() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        populate(&source, 10);
        let registry = Arc::new(PathLockRegistry::new());
        registry.lock_write(&source, Duration::ZERO).unwrap();

        let result = Repairman::new(&source, dir.path().join("target.db"))
            .with_registry(Arc::clone(&registry))
            .with_lock_timeout(Duration::from_millis(20))
            .work();

        assert_eq!(result.error.unwrap().kind, ErrorKind::Lock);
        registry.unlock_write(&source);
    }

    #[test]
    fn cancellation_is_reported() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        populate(&source, 100);
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let result = Repairman::new(&source, dir.path().join("target.db"))
            .with_progress(Progress::new().with_cancellation(cancellation))
            .work();

        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn repairing_into_the_source_is_refused() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        populate(&source, 1);

        let result = Repairman::new(&source, &source).work();

        assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidOperation);
        assert_eq!(count(&source, "tags"), 2);
    }
}
