//! Repair guided by a material.
//!
//! The mechanic does not walk B-trees. It reads the leaf pages a backup
//! recorded for each table, keeps those whose hash still matches, and
//! assembles their rows. Interior pages may be destroyed without losing
//! any row that existed at backup time.
//!
//! Indexes, triggers and views are not created here; see
//! [`Mechanic::associated_sqls`].

use crate::error::{CoreError, CoreResult};
use crate::progress::Progress;
use crate::repair::assembler::Assembler;
use crate::repair::cell::Cell;
use crate::repair::checksum::compute_crc32;
use crate::repair::evaluation::Evaluation;
use crate::repair::material::{Material, MaterialContent};
use crate::repair::page::PageType;
use crate::repair::pager::Pager;
use crate::repair::repairman::assemble_row;
use tracing::{debug, info, warn};

/// Material-driven repair of one database.
#[derive(Debug)]
pub struct Mechanic<'m> {
    material: &'m Material,
}

impl<'m> Mechanic<'m> {
    /// Creates a mechanic for `material`.
    #[must_use]
    pub fn new(material: &'m Material) -> Self {
        Self { material }
    }

    /// Returns the number of pages [`Mechanic::work`] will visit.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.material.page_count() as u64
    }

    /// Assembles every table of the material from its recorded pages.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the material was taken with a
    /// different page size, [`CoreError::Cancelled`] on cancellation, and
    /// assembler errors that are not confined to one table.
    pub fn work(
        &self,
        pager: &mut Pager,
        assembler: &mut dyn Assembler,
        evaluation: &mut Evaluation,
        progress: &mut Progress,
    ) -> CoreResult<()> {
        let info = &self.material.info;
        if info.page_size as usize != pager.page_size() {
            return Err(CoreError::corruption(format!(
                "material page size {} differs from database page size {}",
                info.page_size,
                pager.page_size()
            )));
        }
        if let Some(salt) = pager.wal_salt() {
            if salt != info.wal_salt {
                info!(?salt, recorded = ?info.wal_salt, "WAL changed since backup, ignoring it");
                pager.dispose_wal()?;
            }
        }

        for (table, content) in &self.material.contents {
            progress.check_cancelled()?;
            self.assemble_table(pager, assembler, evaluation, progress, table, content)?;
        }

        for (table, content) in &self.material.contents {
            if content.sequence > 0 && evaluation.table(table).is_some_and(|t| t.recovered) {
                assembler.assemble_sequence(table, content.sequence)?;
            }
        }
        Ok(())
    }

    /// Returns the index, trigger and view SQL of the `material` tables
    /// that `evaluation` reports as recovered.
    ///
    /// Executing it is left to the caller, after every table is complete.
    pub fn associated_sqls<'e>(
        material: &'e Material,
        evaluation: &'e Evaluation,
    ) -> impl Iterator<Item = &'e str> {
        material
            .contents
            .iter()
            .filter(|(table, _)| evaluation.table(table).is_some_and(|t| t.recovered))
            .flat_map(|(_, content)| content.associated_sqls.iter().map(String::as_str))
    }

    fn assemble_table(
        &self,
        pager: &mut Pager,
        assembler: &mut dyn Assembler,
        evaluation: &mut Evaluation,
        progress: &mut Progress,
        table: &str,
        content: &MaterialContent,
    ) -> CoreResult<()> {
        if let Err(error) = assembler.assemble_table(table, &content.sql) {
            warn!(table, error = %error, "table cannot be created from material");
            assembler.mark_as_failed();
            evaluation.set_recovered(table, false);
            return Ok(());
        }
        let columns = assembler.table_columns()?.len();
        evaluation.add_table(table, columns);

        match self.assemble_pages(pager, assembler, evaluation, progress, table, columns, content) {
            Ok(()) => match assembler.mark_as_assembled() {
                Ok(()) => evaluation.set_recovered(table, true),
                Err(error) => {
                    warn!(table, error = %error, "material table commit failed");
                    evaluation.set_recovered(table, false);
                }
            },
            Err(CoreError::Cancelled) => {
                assembler.mark_as_failed();
                return Err(CoreError::Cancelled);
            }
            Err(error) => {
                warn!(table, error = %error, "material table assembly failed");
                assembler.mark_as_failed();
                evaluation.set_recovered(table, false);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_pages(
        &self,
        pager: &mut Pager,
        assembler: &mut dyn Assembler,
        evaluation: &mut Evaluation,
        progress: &mut Progress,
        table: &str,
        columns: usize,
        content: &MaterialContent,
    ) -> CoreResult<()> {
        for recorded in &content.verified_pages {
            progress.check_cancelled()?;
            progress.increase(1);

            let Ok(page) = pager.acquire_page(recorded.number) else {
                evaluation.record_corrupted_page(table);
                continue;
            };
            if compute_crc32(page.data()) != recorded.hash || page.page_type() != PageType::LeafTable {
                pager.mark_as_corrupted(recorded.number, "page differs from material");
                evaluation.record_corrupted_page(table);
                continue;
            }

            for offset in page.cell_pointers()? {
                match Cell::parse(pager, &page, offset) {
                    Ok(cell) => assemble_row(assembler, evaluation, table, columns, &cell)?,
                    Err(error) => {
                        debug!(page = recorded.number, error = %error, "cell skipped");
                        evaluation.record_row(table, 0, columns);
                    }
                }
            }
            evaluation.record_page(table);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{BackupHandle, PathLockRegistry};
    use crate::repair::assembler::SqliteAssembler;
    use crate::repair::backup::Backup;
    use crate::repair::pager::PagerOptions;
    use rusqlite::Connection;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn pages_changed_after_backup_are_rejected() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let target = dir.path().join("target.db");
        let connection = Connection::open(&source).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE kept(a INTEGER, b TEXT);
                 CREATE TABLE changed(a INTEGER);
                 INSERT INTO kept VALUES(1, 'x'), (2, 'y');
                 INSERT INTO changed VALUES(1);",
            )
            .unwrap();

        let registry = Arc::new(PathLockRegistry::new());
        let mut lock = BackupHandle::for_path(&registry, &source, Duration::from_secs(1));
        let material = Backup::new(&source).work(&mut lock).unwrap();
        connection.execute("INSERT INTO changed VALUES(2)", []).unwrap();
        drop(connection);

        let mut pager = Pager::open(&source, &PagerOptions::default()).unwrap();
        let mut assembler = SqliteAssembler::new(&target);
        let mut evaluation = Evaluation::new();
        let mut progress = Progress::new();
        Mechanic::new(&material)
            .work(&mut pager, &mut assembler, &mut evaluation, &mut progress)
            .unwrap();
        assembler.finish().unwrap();

        let kept = evaluation.table("kept").unwrap();
        assert_eq!((kept.ok_pages, kept.rows), (1, 2));
        let changed = evaluation.table("changed").unwrap();
        assert_eq!((changed.ok_pages, changed.corrupted_pages, changed.rows), (0, 1, 0));
        assert!(pager.is_corrupted(material.contents["changed"].verified_pages[0].number));
        assert!(evaluation.score() < 1.0);
    }
}
