//! Top-down traversal of table B-trees.
//!
//! [`Crawlable`] walks one B-tree from its root, depth first, left to
//! right. Interior pages push their children; leaf pages emit cells. Each
//! walk keeps its own visited set: reaching a page a second time means the
//! interior pointers form a cycle, so that page is marked as corrupted and
//! skipped. The walk is therefore bounded by the page count.
//!
//! Damaged pages and cells are reported to the delegate and counted; they
//! never end the walk. Only cancellation and delegate failures do.

use crate::error::{CoreError, CoreResult};
use crate::repair::cell::Cell;
use crate::repair::master::{MasterItem, MASTER_ROOT_PAGE};
use crate::repair::page::{Page, PageType};
use crate::repair::pager::Pager;
use crate::repair::value::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Receives the results of a crawl.
pub trait CrawlerDelegate {
    /// Called for every decoded row.
    ///
    /// # Errors
    ///
    /// An error stops the crawl and is returned from [`Crawlable::crawl`].
    fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()>;

    /// Called after a B-tree page has been fully processed.
    fn on_page_crawled(&mut self, _page: &Page) {}

    /// Asked before page `number` is read. Returning false skips the page
    /// and its subtree without counting it as damage.
    fn should_crawl_page(&mut self, _number: u32) -> bool {
        true
    }

    /// Called for every page or cell that could not be read.
    fn on_crawler_error(&mut self, _page: u32, _error: &CoreError) {}

    /// Polled at every page boundary.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Counters of one crawl.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
    /// B-tree pages processed.
    pub pages: u32,
    /// Pages that were unreadable, of the wrong type, or revisited.
    pub corrupted_pages: u32,
    /// Rows emitted.
    pub cells: u64,
    /// Rows that could not be decoded at all.
    pub corrupted_cells: u64,
}

impl CrawlStats {
    /// Returns true if any page or cell was lost.
    #[must_use]
    pub fn hit_corruption(&self) -> bool {
        self.corrupted_pages > 0 || self.corrupted_cells > 0
    }
}

/// Crawl driver over one pager.
#[derive(Debug)]
pub struct Crawlable<'p> {
    pager: &'p mut Pager,
    visited: BTreeSet<u32>,
}

impl<'p> Crawlable<'p> {
    /// Creates a crawler over `pager`.
    pub fn new(pager: &'p mut Pager) -> Self {
        Self {
            pager,
            visited: BTreeSet::new(),
        }
    }

    /// Returns the pager.
    pub fn pager(&mut self) -> &mut Pager {
        self.pager
    }

    /// Returns every page reached by any crawl so far.
    #[must_use]
    pub fn visited(&self) -> &BTreeSet<u32> {
        &self.visited
    }

    /// Walks the table B-tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cancelled`] when the delegate reports
    /// cancellation, or the first error of [`CrawlerDelegate::on_cell_crawled`].
    pub fn crawl(&mut self, root: u32, delegate: &mut dyn CrawlerDelegate) -> CoreResult<CrawlStats> {
        let mut stats = CrawlStats::default();
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];

        while let Some(number) = stack.pop() {
            if delegate.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            if !seen.insert(number) {
                let error = CoreError::corruption(format!("page {number} visited twice"));
                self.pager.mark_as_corrupted(number, "page visited twice");
                stats.corrupted_pages += 1;
                delegate.on_crawler_error(number, &error);
                continue;
            }
            self.visited.insert(number);
            if !delegate.should_crawl_page(number) {
                continue;
            }

            let page = match self.pager.acquire_page(number) {
                Ok(page) => page,
                Err(error) => {
                    stats.corrupted_pages += 1;
                    delegate.on_crawler_error(number, &error);
                    continue;
                }
            };
            trace!(page = number, kind = ?page.page_type(), "crawling page");

            match page.page_type() {
                PageType::InteriorTable => match page.children() {
                    Ok(children) => {
                        stack.extend(children.into_iter().rev());
                        stats.pages += 1;
                        delegate.on_page_crawled(&page);
                    }
                    Err(error) => self.reject(number, error, &mut stats, delegate),
                },
                PageType::LeafTable => match page.cell_pointers() {
                    Ok(pointers) => {
                        for offset in pointers {
                            match Cell::parse(self.pager, &page, offset) {
                                Ok(cell) => {
                                    stats.cells += 1;
                                    delegate.on_cell_crawled(cell)?;
                                }
                                Err(error) => {
                                    stats.corrupted_cells += 1;
                                    delegate.on_crawler_error(number, &error);
                                }
                            }
                        }
                        stats.pages += 1;
                        delegate.on_page_crawled(&page);
                    }
                    Err(error) => self.reject(number, error, &mut stats, delegate),
                },
                other => {
                    let error = CoreError::corruption(format!(
                        "page {number} has unexpected type {other:?}"
                    ));
                    self.reject(number, error, &mut stats, delegate);
                }
            }
        }

        Ok(stats)
    }

    fn reject(
        &mut self,
        number: u32,
        error: CoreError,
        stats: &mut CrawlStats,
        delegate: &mut dyn CrawlerDelegate,
    ) {
        self.pager.mark_as_corrupted(number, error.to_string());
        stats.corrupted_pages += 1;
        delegate.on_crawler_error(number, &error);
    }
}

/// Collects every schema object from `sqlite_master`.
#[derive(Debug, Default)]
pub struct MasterCrawler {
    items: Vec<MasterItem>,
}

impl CrawlerDelegate for MasterCrawler {
    fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()> {
        if let Some(item) = MasterItem::from_cell(&cell) {
            self.items.push(item);
        }
        Ok(())
    }
}

impl MasterCrawler {
    /// Crawls `sqlite_master` and returns its objects in storage order.
    ///
    /// # Errors
    ///
    /// Never fails on corruption; damaged rows are skipped.
    pub fn work(crawlable: &mut Crawlable<'_>) -> CoreResult<(Vec<MasterItem>, CrawlStats)> {
        let mut crawler = Self::default();
        let stats = crawlable.crawl(MASTER_ROOT_PAGE, &mut crawler)?;
        Ok((crawler.items, stats))
    }
}

/// Collects `name -> seq` from `sqlite_sequence`.
#[derive(Debug, Default)]
pub struct SequenceCrawler {
    sequences: HashMap<String, i64>,
}

impl CrawlerDelegate for SequenceCrawler {
    fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()> {
        if let [name, seq, ..] = cell.values() {
            if let (Some(name), Value::Integer(seq)) = (name.as_text(), seq) {
                self.sequences.insert(name.to_string(), *seq);
            }
        }
        Ok(())
    }
}

impl SequenceCrawler {
    /// Crawls the sequence table rooted at `root`.
    ///
    /// # Errors
    ///
    /// Never fails on corruption; damaged rows are skipped.
    pub fn work(crawlable: &mut Crawlable<'_>, root: u32) -> CoreResult<HashMap<String, i64>> {
        let mut crawler = Self::default();
        crawlable.crawl(root, &mut crawler)?;
        Ok(crawler.sequences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::pager::{PagerOptions, DATABASE_MAGIC};
    use reviver_storage::InMemoryBackend;

    const PAGE: usize = 512;

    fn image(pages: usize) -> Vec<u8> {
        let mut data = vec![0u8; PAGE * pages];
        data[..16].copy_from_slice(DATABASE_MAGIC);
        data[16..18].copy_from_slice(&(PAGE as u16).to_be_bytes());
        data[100] = 13;
        data
    }

    fn interior(data: &mut [u8], page: usize, children: &[u32], right: u32) {
        let base = (page - 1) * PAGE;
        data[base] = 5;
        data[base + 3..base + 5].copy_from_slice(&(children.len() as u16).to_be_bytes());
        data[base + 8..base + 12].copy_from_slice(&right.to_be_bytes());
        let mut content = PAGE;
        for (i, child) in children.iter().enumerate() {
            content -= 5;
            data[base + content..base + content + 4].copy_from_slice(&child.to_be_bytes());
            data[base + content + 4] = i as u8 + 1;
            let slot = base + 12 + i * 2;
            data[slot..slot + 2].copy_from_slice(&(content as u16).to_be_bytes());
        }
    }

    fn leaf(data: &mut [u8], page: usize, rowids: &[u8]) {
        let base = (page - 1) * PAGE;
        data[base] = 13;
        data[base + 3..base + 5].copy_from_slice(&(rowids.len() as u16).to_be_bytes());
        let mut content = PAGE;
        for (i, &rowid) in rowids.iter().enumerate() {
            // payload: header [2, 1] + one byte integer
            let cell = [3, rowid, 2, 1, rowid];
            content -= cell.len();
            data[base + content..base + content + cell.len()].copy_from_slice(&cell);
            let slot = base + 8 + i * 2;
            data[slot..slot + 2].copy_from_slice(&(content as u16).to_be_bytes());
        }
    }

    fn pager(data: Vec<u8>) -> Pager {
        Pager::with_backend(
            Box::new(InMemoryBackend::with_data(data)),
            None,
            &PagerOptions::default(),
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Rows(Vec<i64>, Vec<u32>);

    impl CrawlerDelegate for Rows {
        fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()> {
            self.0.push(cell.rowid());
            Ok(())
        }

        fn on_crawler_error(&mut self, page: u32, _error: &CoreError) {
            self.1.push(page);
        }
    }

    #[test]
    fn crawls_in_key_order() {
        let mut data = image(4);
        interior(&mut data, 2, &[3], 4);
        leaf(&mut data, 3, &[1, 2]);
        leaf(&mut data, 4, &[3]);

        let mut pager = pager(data);
        let mut crawlable = Crawlable::new(&mut pager);
        let mut rows = Rows::default();
        let stats = crawlable.crawl(2, &mut rows).unwrap();

        assert_eq!(rows.0, vec![1, 2, 3]);
        assert_eq!(stats.pages, 3);
        assert!(!stats.hit_corruption());
        assert_eq!(crawlable.visited(), &BTreeSet::from([2, 3, 4]));
    }

    #[test]
    fn cycle_terminates_and_marks_page() {
        let mut data = image(4);
        interior(&mut data, 2, &[3], 4);
        // Page 4 points back at its ancestor.
        interior(&mut data, 4, &[2], 3);
        leaf(&mut data, 3, &[7]);

        let mut pager = pager(data);
        let mut rows = Rows::default();
        let stats = Crawlable::new(&mut pager).crawl(2, &mut rows).unwrap();

        assert_eq!(rows.0, vec![7]);
        assert!(stats.corrupted_pages >= 1);
        assert!(pager.is_corrupted(2) || pager.is_corrupted(3));
    }

    #[test]
    fn zeroed_root_is_reported() {
        let mut data = image(3);
        leaf(&mut data, 3, &[1]);

        let mut pager = pager(data);
        let mut rows = Rows::default();
        let stats = Crawlable::new(&mut pager).crawl(2, &mut rows).unwrap();

        assert!(rows.0.is_empty());
        assert_eq!(rows.1, vec![2]);
        assert_eq!(stats.corrupted_pages, 1);
        assert!(pager.is_corrupted(2));
    }

    #[test]
    fn out_of_range_child_is_skipped() {
        let mut data = image(3);
        interior(&mut data, 2, &[3], 99);
        leaf(&mut data, 3, &[4]);

        let mut pager = pager(data);
        let mut rows = Rows::default();
        let stats = Crawlable::new(&mut pager).crawl(2, &mut rows).unwrap();
        assert_eq!(rows.0, vec![4]);
        assert_eq!(stats.corrupted_pages, 1);
    }

    struct Skipping(Rows, u32);

    impl CrawlerDelegate for Skipping {
        fn on_cell_crawled(&mut self, cell: Cell) -> CoreResult<()> {
            self.0.on_cell_crawled(cell)
        }

        fn should_crawl_page(&mut self, number: u32) -> bool {
            number != self.1
        }
    }

    #[test]
    fn skipped_pages_are_not_read() {
        let mut data = image(4);
        interior(&mut data, 2, &[3], 4);
        leaf(&mut data, 3, &[1, 2]);
        leaf(&mut data, 4, &[3]);

        let mut pager = pager(data);
        let mut skipping = Skipping(Rows::default(), 3);
        let stats = Crawlable::new(&mut pager).crawl(2, &mut skipping).unwrap();

        assert_eq!(skipping.0 .0, vec![3]);
        assert_eq!(stats.pages, 2);
        assert!(!stats.hit_corruption());
    }

    struct Cancelled;

    impl CrawlerDelegate for Cancelled {
        fn on_cell_crawled(&mut self, _cell: Cell) -> CoreResult<()> {
            Ok(())
        }

        fn is_cancelled(&self) -> bool {
            true
        }
    }

    #[test]
    fn cancellation_stops_at_page_boundary() {
        let mut pager = pager(image(1));
        let result = Crawlable::new(&mut pager).crawl(1, &mut Cancelled);
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
