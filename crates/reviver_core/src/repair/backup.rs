//! Producing a material from a healthy database.

use crate::error::CoreResult;
use crate::lock::BackupHandle;
use crate::progress::Progress;
use crate::repair::cell::Cell;
use crate::repair::checksum::compute_crc32;
use crate::repair::cipher::CipherKey;
use crate::repair::crawler::{Crawlable, CrawlerDelegate, MasterCrawler, SequenceCrawler};
use crate::repair::incremental::IncrementalMaterial;
use crate::repair::master::{MasterKind, SEQUENCE_TABLE};
use crate::repair::material::{Material, MaterialContent, MaterialInfo, VerifiedPage};
use crate::repair::page::{Page, PageType};
use crate::repair::pager::{Pager, PagerOptions};
use crate::repair::wal::Wal;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides by table name whether a table is backed up.
pub type BackupFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct LeafRecorder<'a> {
    pages: Vec<VerifiedPage>,
    unchanged: BTreeMap<u32, u32>,
    reused: usize,
    progress: &'a mut Progress,
}

impl CrawlerDelegate for LeafRecorder<'_> {
    fn on_cell_crawled(&mut self, _cell: Cell) -> CoreResult<()> {
        Ok(())
    }

    fn on_page_crawled(&mut self, page: &Page) {
        if page.page_type() == PageType::LeafTable {
            self.pages.push(VerifiedPage {
                number: page.number(),
                hash: compute_crc32(page.data()),
            });
        }
        self.progress.increase(1);
    }

    fn should_crawl_page(&mut self, number: u32) -> bool {
        match self.unchanged.remove(&number) {
            Some(hash) => {
                self.pages.push(VerifiedPage { number, hash });
                self.reused += 1;
                self.progress.increase(1);
                false
            }
            None => true,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }
}

/// Crawls a database and summarizes it as a [`Material`].
pub struct Backup {
    path: PathBuf,
    options: PagerOptions,
    key: Option<CipherKey>,
    filter: Option<BackupFilter>,
    incremental: Option<IncrementalMaterial>,
    progress: Progress,
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("path", &self.path)
            .field("encrypted", &self.key.is_some())
            .field("filtered", &self.filter.is_some())
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl Backup {
    /// Creates a backup of the database at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: PagerOptions::default(),
            key: None,
            filter: None,
            incremental: None,
            progress: Progress::new(),
        }
    }

    /// Encrypts saved materials with `key`.
    #[must_use]
    pub fn with_key(mut self, key: Option<CipherKey>) -> Self {
        self.key = key;
        self
    }

    /// Only backs up tables for which `filter` returns true.
    #[must_use]
    pub fn with_filter(mut self, filter: Option<BackupFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Lets the backup extend the newest material when `state`, left by
    /// the previous backup, says nothing outside the WAL changed since.
    #[must_use]
    pub fn with_incremental(mut self, state: Option<IncrementalMaterial>) -> Self {
        self.incremental = state;
        self
    }

    /// Reports progress and honors cancellation through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the state to hand to the next backup. Set once
    /// [`Backup::work`] succeeded.
    #[must_use]
    pub fn incremental(&self) -> Option<IncrementalMaterial> {
        self.incremental
    }

    /// Builds the material under the read lock of `lock`.
    ///
    /// # Errors
    ///
    /// Returns a lock error if the read lock is not granted, and any error
    /// that prevents opening the database.
    pub fn work(&mut self, lock: &mut BackupHandle) -> CoreResult<Material> {
        lock.acquire_read_lock()?;
        let result = self.build();
        if let Err(error) = lock.release_read_lock() {
            warn!(path = %self.path.display(), error = %error, "releasing backup read lock failed");
        }
        result
    }

    /// Builds the material and saves it next to the database.
    ///
    /// # Errors
    ///
    /// See [`Backup::work`] and [`Material::save`].
    pub fn save(&mut self, lock: &mut BackupHandle) -> CoreResult<PathBuf> {
        let material = self.work(lock)?;
        material.save(&self.path, self.key.as_ref())
    }

    fn is_included(&self, table: &str) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(table))
    }

    fn previous_material(&self, pager: &Pager, changed: &BTreeSet<u32>) -> Option<Material> {
        let state = self.incremental?;
        let previous = match Material::load(&self.path, self.key.as_ref()) {
            Ok(previous) => previous?,
            Err(error) => {
                debug!(path = %self.path.display(), error = %error, "previous material unusable");
                return None;
            }
        };
        state
            .accepts(&previous, pager.wal_salt(), pager.page_size() as u32, changed.len())
            .then_some(previous)
    }

    fn build(&mut self) -> CoreResult<Material> {
        let mut pager = Pager::open(&self.path, &self.options)?;
        self.progress.set_total(u64::from(pager.page_count()));

        let changed = pager.wal().map(Wal::pages).unwrap_or_default();
        let previous = self.previous_material(&pager, &changed);
        let page_count = pager.page_count();
        let wal_salt = pager.wal_salt().unwrap_or_default();

        let info = MaterialInfo {
            page_size: pager.page_size() as u32,
            reserved_bytes: pager.reserved_bytes() as u32,
            wal_salt,
            n_backfill: pager.backfill(),
            sequence_root_page: 0,
        };
        let mut material = Material::new(info);

        let mut crawlable = Crawlable::new(&mut pager);
        let (items, _) = MasterCrawler::work(&mut crawlable)?;

        let sequence_root = items
            .iter()
            .find(|item| item.is_table() && item.name == SEQUENCE_TABLE)
            .map_or(0, |item| item.root_page);
        material.info.sequence_root_page = sequence_root;
        let sequences = if sequence_root > 0 {
            SequenceCrawler::work(&mut crawlable, sequence_root)?
        } else {
            Default::default()
        };

        let mut reused = 0;
        let included: Vec<_> = items
            .iter()
            .filter(|item| item.is_crawlable_table() && self.is_included(&item.name))
            .collect();
        for item in included {
            let sql = item.sql.clone().unwrap_or_default();
            let unchanged = previous
                .as_ref()
                .and_then(|previous| previous.contents.get(&item.name))
                .filter(|content| content.root_page == item.root_page && content.sql == sql)
                .map(|content| {
                    content
                        .verified_pages
                        .iter()
                        .filter(|page| page.number <= page_count && !changed.contains(&page.number))
                        .map(|page| (page.number, page.hash))
                        .collect()
                })
                .unwrap_or_default();

            let mut recorder = LeafRecorder {
                pages: Vec::new(),
                unchanged,
                reused: 0,
                progress: &mut self.progress,
            };
            let stats = crawlable.crawl(item.root_page, &mut recorder)?;
            if stats.hit_corruption() {
                warn!(table = %item.name, corrupted_pages = stats.corrupted_pages, "table is damaged at backup time");
            }
            reused += recorder.reused;

            let associated_sqls = items
                .iter()
                .filter(|other| other.kind != MasterKind::Table && other.table_name == item.name)
                .filter_map(|other| other.sql.clone())
                .collect();
            material.contents.insert(
                item.name.clone(),
                MaterialContent {
                    root_page: item.root_page,
                    sequence: sequences.get(&item.name).copied().unwrap_or(0),
                    sql,
                    associated_sqls,
                    verified_pages: recorder.pages,
                },
            );
        }

        let incremental_backups = match (previous.is_some(), self.incremental) {
            (true, Some(state)) => state.incremental_backups + 1,
            _ => 0,
        };
        self.incremental = Some(IncrementalMaterial {
            wal_salt,
            incremental_backups,
            reused_pages: reused,
        });

        self.progress.finish();
        info!(
            path = %self.path.display(),
            tables = material.contents.len(),
            pages = material.page_count(),
            reused,
            incremental = incremental_backups > 0,
            "backup crawled"
        );
        Ok(material)
    }
}
