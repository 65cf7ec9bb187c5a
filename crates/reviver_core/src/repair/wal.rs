//! Write-ahead log parsing.
//!
//! ```text
//! WAL header (32 bytes, big-endian fields)
//! ┌──────────┬─────────┬───────────┬────────────┬────────┬────────┬─────────┬─────────┐
//! │ magic    │ version │ page size │ checkpoint │ salt-1 │ salt-2 │ cksum-1 │ cksum-2 │
//! └──────────┴─────────┴───────────┴────────────┴────────┴────────┴─────────┴─────────┘
//!
//! Frame (24-byte header + one page)
//! ┌──────────┬─────────┬────────┬────────┬─────────┬─────────┬──────────────┐
//! │ page no. │ db size │ salt-1 │ salt-2 │ cksum-1 │ cksum-2 │ page bytes   │
//! └──────────┴─────────┴────────┴────────┴─────────┴─────────┴──────────────┘
//! ```
//!
//! A frame is trusted only when its salts match the header and its
//! checksum chains from the previous frame. The first frame that fails
//! ends the trusted prefix; nothing after it is read.

use crate::error::{CoreError, CoreResult};
use crate::repair::checksum::wal_checksum;
use crate::repair::deserialize::be_u32;
use crate::repair::pager::is_valid_page_size;
use crate::repair::shm::Shm;
use reviver_storage::StorageBackend;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Size of the WAL file header.
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of a frame header.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Magic with little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;

/// Magic with big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;

/// The only WAL format version.
pub const WAL_VERSION: u32 = 3_007_000;

/// The decoded WAL file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Whether checksum words are big-endian.
    pub big_endian: bool,
    /// Page size of every frame.
    pub page_size: u32,
    /// Checkpoint sequence number.
    pub checkpoint_sequence: u32,
    /// Salts identifying this WAL generation.
    pub salt: (u32, u32),
    /// Header checksum, the seed of the first frame's checksum.
    pub checksum: (u32, u32),
}

impl WalHeader {
    /// Decodes and validates a WAL header.
    ///
    /// # Errors
    ///
    /// Returns a format error for a bad magic, version or page size, and a
    /// checksum error when the header checksum does not match.
    pub fn parse(data: &[u8]) -> CoreResult<Self> {
        if data.len() < WAL_HEADER_SIZE {
            return Err(CoreError::invalid_format(format!(
                "WAL header too short: {} bytes",
                data.len()
            )));
        }
        let magic = be_u32(data, 0)?;
        let big_endian = match magic {
            WAL_MAGIC_LE => false,
            WAL_MAGIC_BE => true,
            other => {
                return Err(CoreError::invalid_format(format!(
                    "bad WAL magic {other:#010x}"
                )))
            }
        };
        let version = be_u32(data, 4)?;
        if version != WAL_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported WAL version {version}"
            )));
        }
        let page_size = be_u32(data, 8)?;
        if !is_valid_page_size(page_size as usize) {
            return Err(CoreError::invalid_format(format!(
                "bad WAL page size {page_size}"
            )));
        }

        let stored = (be_u32(data, 24)?, be_u32(data, 28)?);
        let computed = wal_checksum(&data[..24], big_endian, (0, 0));
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored.0,
                actual: computed.0,
            });
        }

        Ok(Self {
            big_endian,
            page_size,
            checkpoint_sequence: be_u32(data, 12)?,
            salt: (be_u32(data, 16)?, be_u32(data, 20)?),
            checksum: stored,
        })
    }
}

/// A trusted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrame {
    /// 1-based frame index.
    pub index: u32,
    /// Database page this frame holds.
    pub page_number: u32,
    /// Database size in pages after the commit; zero for non-commit frames.
    pub db_size: u32,
}

impl WalFrame {
    /// Returns true if this frame ends a transaction.
    #[must_use]
    pub fn is_commit(&self) -> bool {
        self.db_size > 0
    }
}

/// A parsed write-ahead log.
pub struct Wal {
    backend: Box<dyn StorageBackend>,
    header: WalHeader,
    frames: Vec<WalFrame>,
    max_frame: u32,
    page_map: HashMap<u32, u32>,
    db_size: Option<u32>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("header", &self.header)
            .field("valid_frames", &self.frames.len())
            .field("max_frame", &self.max_frame)
            .field("pages", &self.page_map.len())
            .finish()
    }
}

impl Wal {
    /// Parses the header and every trusted frame of a WAL.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or is invalid. Bad
    /// frames never fail the parse; they end the trusted prefix.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let header = WalHeader::parse(&backend.read_up_to(0, WAL_HEADER_SIZE)?)?;
        let mut wal = Self {
            backend,
            header,
            frames: Vec::new(),
            max_frame: 0,
            page_map: HashMap::new(),
            db_size: None,
        };
        wal.parse_frames()?;
        Ok(wal)
    }

    /// Scans frames from the start of the log and returns the number of
    /// frames in the trusted prefix.
    ///
    /// # Errors
    ///
    /// Returns an error only on an I/O failure other than a short read.
    pub fn parse_frames(&mut self) -> CoreResult<u32> {
        let page_size = self.header.page_size as usize;
        let frame_size = WAL_FRAME_HEADER_SIZE + page_size;
        let mut checksum = self.header.checksum;
        let mut frames = Vec::new();

        loop {
            let index = frames.len() as u32 + 1;
            let offset = WAL_HEADER_SIZE as u64 + u64::from(index - 1) * frame_size as u64;
            let bytes = self.backend.read_up_to(offset, frame_size)?;
            if bytes.len() < frame_size {
                break;
            }

            let page_number = be_u32(&bytes, 0)?;
            let db_size = be_u32(&bytes, 4)?;
            let salt = (be_u32(&bytes, 8)?, be_u32(&bytes, 12)?);
            let stored = (be_u32(&bytes, 16)?, be_u32(&bytes, 20)?);
            if page_number == 0 || salt != self.header.salt {
                debug!(frame = index, "WAL frame salt mismatch, ending trusted prefix");
                break;
            }

            let partial = wal_checksum(&bytes[..8], self.header.big_endian, checksum);
            let computed = wal_checksum(
                &bytes[WAL_FRAME_HEADER_SIZE..],
                self.header.big_endian,
                partial,
            );
            if computed != stored {
                warn!(frame = index, "WAL frame checksum mismatch, ending trusted prefix");
                break;
            }

            checksum = computed;
            frames.push(WalFrame {
                index,
                page_number,
                db_size,
            });
        }

        self.frames = frames;
        let valid = self.valid_frames();
        self.set_max_frame(valid);
        Ok(valid)
    }

    /// Limits the trusted frames to what the SHM index acknowledges.
    ///
    /// An SHM describing a different WAL generation (salt mismatch) is
    /// ignored.
    pub fn apply_shm(&mut self, shm: &Shm) {
        if shm.salt() != self.header.salt {
            warn!("shm salt does not match WAL, ignoring shm");
            return;
        }
        let max = self.valid_frames().min(shm.max_frame());
        self.set_max_frame(max);
    }

    fn set_max_frame(&mut self, max_frame: u32) {
        self.max_frame = max_frame.min(self.valid_frames());
        self.page_map.clear();
        self.db_size = None;

        let committed = self.committed_frames();
        for frame in &self.frames[..committed as usize] {
            self.page_map.insert(frame.page_number, frame.index);
            if frame.is_commit() {
                self.db_size = Some(frame.db_size);
            }
        }
    }

    /// Returns the WAL header.
    #[must_use]
    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    /// Returns the number of frames whose checksum chain is intact.
    #[must_use]
    pub fn valid_frames(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Returns the effective recoverable frame count.
    #[must_use]
    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    /// Returns the index of the last commit frame within `max_frame`.
    #[must_use]
    pub fn committed_frames(&self) -> u32 {
        self.frames[..self.max_frame as usize]
            .iter()
            .rev()
            .find(|frame| frame.is_commit())
            .map_or(0, |frame| frame.index)
    }

    /// Returns the salts of this WAL generation.
    #[must_use]
    pub fn salt(&self) -> (u32, u32) {
        self.header.salt
    }

    /// Returns the page size of every frame.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    /// Returns the database size recorded by the last committed frame.
    #[must_use]
    pub fn db_size(&self) -> Option<u32> {
        self.db_size
    }

    /// Returns the latest committed frame holding `page_number`.
    #[must_use]
    pub fn frame_for_page(&self, page_number: u32) -> Option<u32> {
        self.page_map.get(&page_number).copied()
    }

    /// Returns the number of distinct pages held by committed frames.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_map.len()
    }

    /// Returns every page held by a committed frame.
    #[must_use]
    pub fn pages(&self) -> BTreeSet<u32> {
        self.page_map.keys().copied().collect()
    }

    /// Reads the page image of frame `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not trusted or cannot be read.
    pub fn read_frame_page(&self, index: u32) -> CoreResult<Vec<u8>> {
        if index == 0 || index > self.max_frame {
            return Err(CoreError::corruption(format!(
                "WAL frame {index} beyond max frame {}",
                self.max_frame
            )));
        }
        let frame_size = (WAL_FRAME_HEADER_SIZE + self.page_size()) as u64;
        let offset = WAL_HEADER_SIZE as u64
            + u64::from(index - 1) * frame_size
            + WAL_FRAME_HEADER_SIZE as u64;
        Ok(self.backend.read_at(offset, self.page_size())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reviver_storage::InMemoryBackend;

    const PAGE: usize = 512;

    struct Frames {
        data: Vec<u8>,
        checksum: (u32, u32),
        salt: (u32, u32),
    }

    impl Frames {
        fn new(salt: (u32, u32)) -> Self {
            let mut data = vec![0u8; WAL_HEADER_SIZE];
            data[0..4].copy_from_slice(&WAL_MAGIC_BE.to_be_bytes());
            data[4..8].copy_from_slice(&WAL_VERSION.to_be_bytes());
            data[8..12].copy_from_slice(&(PAGE as u32).to_be_bytes());
            data[16..20].copy_from_slice(&salt.0.to_be_bytes());
            data[20..24].copy_from_slice(&salt.1.to_be_bytes());
            let checksum = wal_checksum(&data[..24], true, (0, 0));
            data[24..28].copy_from_slice(&checksum.0.to_be_bytes());
            data[28..32].copy_from_slice(&checksum.1.to_be_bytes());
            Self { data, checksum, salt }
        }

        fn push(&mut self, page_number: u32, db_size: u32, fill: u8) {
            let mut header = [0u8; WAL_FRAME_HEADER_SIZE];
            header[0..4].copy_from_slice(&page_number.to_be_bytes());
            header[4..8].copy_from_slice(&db_size.to_be_bytes());
            header[8..12].copy_from_slice(&self.salt.0.to_be_bytes());
            header[12..16].copy_from_slice(&self.salt.1.to_be_bytes());
            let page = vec![fill; PAGE];
            let partial = wal_checksum(&header[..8], true, self.checksum);
            self.checksum = wal_checksum(&page, true, partial);
            header[16..20].copy_from_slice(&self.checksum.0.to_be_bytes());
            header[20..24].copy_from_slice(&self.checksum.1.to_be_bytes());
            self.data.extend_from_slice(&header);
            self.data.extend_from_slice(&page);
        }

        fn open(self) -> Wal {
            Wal::open(Box::new(InMemoryBackend::with_data(self.data))).unwrap()
        }
    }

    #[test]
    fn parses_committed_frames() {
        let mut frames = Frames::new((1, 2));
        frames.push(2, 0, 0xaa);
        frames.push(3, 3, 0xbb);
        let wal = frames.open();

        assert_eq!(wal.valid_frames(), 2);
        assert_eq!(wal.committed_frames(), 2);
        assert_eq!(wal.db_size(), Some(3));
        assert_eq!(wal.frame_for_page(3), Some(2));
        assert_eq!(wal.read_frame_page(1).unwrap(), vec![0xaa; PAGE]);
    }

    #[test]
    fn corrupted_checksum_truncates_prefix() {
        let mut frames = Frames::new((1, 2));
        for i in 0..5 {
            frames.push(i + 2, i + 2, i as u8);
        }
        frames.push(9, 9, 0xee);
        frames.push(10, 10, 0xef);
        // Flip a byte inside frame 6's page.
        let frame_size = WAL_FRAME_HEADER_SIZE + PAGE;
        let offset = WAL_HEADER_SIZE + 5 * frame_size + WAL_FRAME_HEADER_SIZE + 7;
        frames.data[offset] ^= 0xff;

        let wal = frames.open();
        assert_eq!(wal.valid_frames(), 5);
        assert_eq!(wal.max_frame(), 5);
        assert_eq!(wal.frame_for_page(9), None);
    }

    #[test]
    fn uncommitted_tail_is_not_mapped() {
        let mut frames = Frames::new((1, 2));
        frames.push(2, 2, 1);
        frames.push(5, 0, 2);
        let wal = frames.open();

        assert_eq!(wal.valid_frames(), 2);
        assert_eq!(wal.committed_frames(), 1);
        assert_eq!(wal.frame_for_page(5), None);
    }

    #[test]
    fn salt_change_ends_prefix() {
        let mut frames = Frames::new((1, 2));
        frames.push(2, 2, 1);
        frames.salt = (3, 4);
        frames.push(3, 3, 1);
        assert_eq!(frames.open().valid_frames(), 1);
    }

    #[test]
    fn bad_header_checksum_is_rejected() {
        let mut frames = Frames::new((1, 2));
        frames.data[12] ^= 1;
        let result = Wal::open(Box::new(InMemoryBackend::with_data(frames.data)));
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn bad_magic_is_format_error() {
        let result = Wal::open(Box::new(InMemoryBackend::with_data(vec![0u8; 64])));
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }
}
