//! Page-level access to a possibly damaged database file.
//!
//! The pager maps page numbers to bytes. When a WAL is present, committed
//! frames within the trusted prefix shadow the main file. Every page that
//! cannot be read or decoded is recorded with a reason so that scoring and
//! later crawls can see which parts of the file were lost.
//!
//! # Errors
//!
//! Opening fails only when the database file cannot be opened at all or
//! no usable page size can be determined. Individual page failures are
//! returned per call and never invalidate the pager.

use crate::error::{CoreError, CoreResult};
use crate::repair::deserialize::{be_u16, be_u32};
use crate::repair::page::{Page, DATABASE_HEADER_SIZE};
use crate::repair::shm::Shm;
use crate::repair::wal::Wal;
use reviver_storage::{FileBackend, StorageBackend};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The 16-byte magic at the start of every database file.
pub const DATABASE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Returns true for a power of two between 512 and 65536.
#[must_use]
pub fn is_valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (512..=65536).contains(&size)
}

/// Decodes the page size field at header offset 16.
#[must_use]
pub fn decode_page_size(raw: u16) -> usize {
    if raw == 1 {
        65536
    } else {
        usize::from(raw)
    }
}

/// Returns the path of the WAL belonging to `path`.
#[must_use]
pub fn wal_path(path: &Path) -> PathBuf {
    sibling(path, "-wal")
}

/// Returns the path of the SHM belonging to `path`.
#[must_use]
pub fn shm_path(path: &Path) -> PathBuf {
    sibling(path, "-shm")
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Decodes page bytes before they are interpreted.
///
/// Encrypted databases plug their page cipher in here. The pager calls
/// `decode` on every page it hands out, including page 1.
pub trait PageCodec: Send + Sync {
    /// Decodes `data` in place.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the page cannot be decoded.
    fn decode(&self, page_number: u32, data: &mut [u8]) -> CoreResult<()>;
}

/// Options for opening a [`Pager`].
#[derive(Clone)]
pub struct PagerOptions {
    /// Overlay committed WAL frames.
    pub use_wal: bool,
    /// Page size to use instead of the header's (required with a codec).
    pub page_size: Option<usize>,
    /// Reserved bytes to use instead of the header's.
    pub reserved_bytes: Option<usize>,
    /// Page decoder.
    pub codec: Option<Arc<dyn PageCodec>>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            use_wal: true,
            page_size: None,
            reserved_bytes: None,
            codec: None,
        }
    }
}

impl std::fmt::Debug for PagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagerOptions")
            .field("use_wal", &self.use_wal)
            .field("page_size", &self.page_size)
            .field("reserved_bytes", &self.reserved_bytes)
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

/// Reads pages of one database for one repair or backup session.
pub struct Pager {
    file: Box<dyn StorageBackend>,
    wal: Option<Wal>,
    codec: Option<Arc<dyn PageCodec>>,
    page_size: usize,
    reserved_bytes: usize,
    page_count: u32,
    freelist_trunk: u32,
    backfill: u32,
    corrupted: BTreeMap<u32, String>,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("reserved_bytes", &self.reserved_bytes)
            .field("page_count", &self.page_count)
            .field("wal", &self.wal)
            .field("corrupted", &self.corrupted.len())
            .finish()
    }
}

impl Pager {
    /// Opens the database at `path` read-only, with its WAL and SHM when
    /// present and enabled.
    ///
    /// A WAL or SHM that cannot be parsed is ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the database file cannot be opened, and a
    /// format error if no valid page size is available.
    pub fn open(path: &Path, options: &PagerOptions) -> CoreResult<Self> {
        let file = FileBackend::open_read_only(path)?;

        let mut wal = None;
        let mut backfill = 0;
        let wal_file = wal_path(path);
        if options.use_wal && wal_file.exists() {
            match FileBackend::open_read_only(&wal_file)
                .map_err(CoreError::from)
                .and_then(|backend| Wal::open(Box::new(backend)))
            {
                Ok(mut parsed) => {
                    let shm_file = shm_path(path);
                    if shm_file.exists() {
                        match FileBackend::open_read_only(&shm_file)
                            .map_err(CoreError::from)
                            .and_then(|backend| Shm::parse(&backend))
                        {
                            Ok(shm) => {
                                parsed.apply_shm(&shm);
                                backfill = shm.backfill();
                            }
                            Err(e) => warn!(path = %shm_file.display(), error = %e, "ignoring shm"),
                        }
                    }
                    info!(
                        path = %wal_file.display(),
                        valid = parsed.valid_frames(),
                        max_frame = parsed.max_frame(),
                        "WAL parsed"
                    );
                    wal = Some(parsed);
                }
                Err(e) => warn!(path = %wal_file.display(), error = %e, "ignoring WAL"),
            }
        }

        let mut pager = Self::with_backend(Box::new(file), wal, options)?;
        pager.backfill = backfill;
        Ok(pager)
    }

    /// Builds a pager over an already opened main file and WAL.
    ///
    /// # Errors
    ///
    /// Returns a format error if no valid page size is available, and a
    /// config error if a codec is given without an explicit page size.
    pub fn with_backend(
        file: Box<dyn StorageBackend>,
        wal: Option<Wal>,
        options: &PagerOptions,
    ) -> CoreResult<Self> {
        let raw_header = file.read_up_to(0, DATABASE_HEADER_SIZE)?;
        let header_ok =
            raw_header.len() == DATABASE_HEADER_SIZE && raw_header[..16] == DATABASE_MAGIC[..];

        if options.codec.is_some() && options.page_size.is_none() {
            return Err(CoreError::config(
                "codec",
                "a page codec requires an explicit page size",
            ));
        }

        let page_size = match options.page_size {
            Some(size) => size,
            None if header_ok && options.codec.is_none() => decode_page_size(be_u16(&raw_header, 16)?),
            None => match wal.as_ref() {
                Some(wal) => wal.page_size(),
                None => {
                    return Err(CoreError::invalid_format(
                        "database header is unreadable and no page size is known",
                    ))
                }
            },
        };
        if !is_valid_page_size(page_size) {
            return Err(CoreError::invalid_format(format!(
                "invalid page size {page_size}"
            )));
        }

        let reserved_bytes = match options.reserved_bytes {
            Some(reserved) => reserved,
            None if header_ok && options.codec.is_none() => usize::from(raw_header[20]),
            None => 0,
        };
        if reserved_bytes >= page_size - 480 {
            return Err(CoreError::invalid_format(format!(
                "reserved bytes {reserved_bytes} leave no usable space"
            )));
        }

        let wal = match wal {
            Some(wal) if wal.page_size() != page_size => {
                warn!(
                    wal_page_size = wal.page_size(),
                    page_size, "WAL page size differs from database, ignoring WAL"
                );
                None
            }
            other => other,
        };

        let mut pager = Self {
            file,
            wal,
            codec: options.codec.clone(),
            page_size,
            reserved_bytes,
            page_count: 0,
            freelist_trunk: 0,
            backfill: 0,
            corrupted: BTreeMap::new(),
        };
        pager.refresh_page_count()?;
        pager.refresh_header_fields();
        debug!(
            page_size,
            reserved_bytes,
            page_count = pager.page_count,
            "pager opened"
        );
        Ok(pager)
    }

    fn refresh_page_count(&mut self) -> CoreResult<()> {
        let file_pages = self.file.size()?.div_ceil(self.page_size as u64);
        self.page_count = match self.wal.as_ref().and_then(Wal::db_size) {
            Some(db_size) => db_size,
            None => u32::try_from(file_pages).unwrap_or(u32::MAX),
        };
        Ok(())
    }

    fn refresh_header_fields(&mut self) {
        match self.read_page_bytes(1) {
            Ok(page) if page.len() >= DATABASE_HEADER_SIZE && page[..16] == DATABASE_MAGIC[..] => {
                self.freelist_trunk = be_u32(&page, 32).unwrap_or(0);
            }
            _ => self.freelist_trunk = 0,
        }
    }

    /// Stops reading WAL frames; all pages come from the main file.
    pub fn dispose_wal(&mut self) -> CoreResult<()> {
        if self.wal.take().is_some() {
            info!("WAL disposed");
            self.refresh_page_count()?;
            self.refresh_header_fields();
        }
        Ok(())
    }

    /// Returns the page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the reserved bytes at the end of each page.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Returns the usable page size.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved_bytes
    }

    /// Returns the number of pages in the database.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Returns the first freelist trunk page, or zero.
    #[must_use]
    pub fn freelist_trunk(&self) -> u32 {
        self.freelist_trunk
    }

    /// Returns the parsed WAL, if in use.
    #[must_use]
    pub fn wal(&self) -> Option<&Wal> {
        self.wal.as_ref()
    }

    /// Returns the WAL salts, if a WAL is in use.
    #[must_use]
    pub fn wal_salt(&self) -> Option<(u32, u32)> {
        self.wal.as_ref().map(Wal::salt)
    }

    /// Returns the SHM backfill count observed at open.
    #[must_use]
    pub fn backfill(&self) -> u32 {
        self.backfill
    }

    fn read_page_bytes(&self, page_number: u32) -> CoreResult<Vec<u8>> {
        if page_number == 0 || page_number > self.page_count {
            return Err(CoreError::corruption(format!(
                "page {page_number} out of range 1..={}",
                self.page_count
            )));
        }

        let mut data = match self
            .wal
            .as_ref()
            .and_then(|wal| wal.frame_for_page(page_number).map(|frame| (wal, frame)))
        {
            Some((wal, frame)) => wal.read_frame_page(frame)?,
            None => {
                let offset = u64::from(page_number - 1) * self.page_size as u64;
                self.file.read_at(offset, self.page_size).map_err(|e| {
                    if e.is_short_read() {
                        CoreError::corruption(format!("page {page_number} is truncated"))
                    } else {
                        e.into()
                    }
                })?
            }
        };

        if let Some(codec) = &self.codec {
            codec.decode(page_number, &mut data)?;
        }
        Ok(data)
    }

    /// Reads the raw bytes of a page.
    ///
    /// A failure marks the page as corrupted.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for out-of-range or truncated pages, a
    /// cipher error if the codec rejects the page, or an I/O error.
    pub fn acquire_data(&mut self, page_number: u32) -> CoreResult<Vec<u8>> {
        self.read_page_bytes(page_number).inspect_err(|e| {
            self.mark_as_corrupted(page_number, e.to_string());
        })
    }

    /// Reads a page for B-tree interpretation.
    ///
    /// # Errors
    ///
    /// See [`Pager::acquire_data`].
    pub fn acquire_page(&mut self, page_number: u32) -> CoreResult<Page> {
        let data = self.acquire_data(page_number)?;
        Ok(Page::new(page_number, data, self.usable_size()))
    }

    /// Reads a page without marking it as corrupted on failure.
    ///
    /// # Errors
    ///
    /// See [`Pager::acquire_data`].
    pub fn read_page(&self, page_number: u32) -> CoreResult<Page> {
        let data = self.read_page_bytes(page_number)?;
        Ok(Page::new(page_number, data, self.usable_size()))
    }

    /// Records that `page_number` is damaged. The first reason wins.
    pub fn mark_as_corrupted(&mut self, page_number: u32, reason: impl Into<String>) {
        if let std::collections::btree_map::Entry::Vacant(entry) =
            self.corrupted.entry(page_number)
        {
            let reason = reason.into();
            warn!(page = page_number, reason = %reason, "page marked as corrupted");
            entry.insert(reason);
        }
    }

    /// Returns true if the page was marked as corrupted.
    #[must_use]
    pub fn is_corrupted(&self, page_number: u32) -> bool {
        self.corrupted.contains_key(&page_number)
    }

    /// Returns every corrupted page with its reason.
    #[must_use]
    pub fn corrupted_pages(&self) -> &BTreeMap<u32, String> {
        &self.corrupted
    }

    /// Walks the freelist and returns every trunk and leaf page on it.
    ///
    /// The walk stops at the first unreadable or repeated trunk.
    pub fn freelist_pages(&mut self) -> BTreeSet<u32> {
        let mut pages = BTreeSet::new();
        let max_leaves = (self.usable_size() - 8) / 4;
        let mut trunk = self.freelist_trunk;

        while trunk != 0 && trunk <= self.page_count && pages.insert(trunk) {
            let Ok(data) = self.read_page_bytes(trunk) else {
                break;
            };
            let next = be_u32(&data, 0).unwrap_or(0);
            let count = (be_u32(&data, 4).unwrap_or(0) as usize).min(max_leaves);
            for i in 0..count {
                if let Ok(leaf) = be_u32(&data, 8 + i * 4) {
                    if leaf != 0 && leaf <= self.page_count {
                        pages.insert(leaf);
                    }
                }
            }
            trunk = next;
        }
        pages
    }
}
