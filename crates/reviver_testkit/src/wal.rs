//! Synthetic WAL and SHM files.
//!
//! [`WalBuilder`] writes frames with a correct checksum chain so tests can
//! damage exactly the frame they care about. [`ShmBuilder`] writes a wal
//! index header claiming any max frame.

use reviver_core::repair::{
    native_checksum, wal_checksum, SHM_HEADER_SIZE, WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE,
    WAL_MAGIC_BE, WAL_MAGIC_LE, WAL_VERSION,
};

struct Frame {
    page_number: u32,
    db_size: u32,
    data: Vec<u8>,
}

/// Builds a WAL file image.
pub struct WalBuilder {
    page_size: u32,
    salt: (u32, u32),
    big_endian: bool,
    frames: Vec<Frame>,
    corrupted: Vec<usize>,
}

impl WalBuilder {
    /// Starts a little-endian WAL for pages of `page_size` bytes.
    pub fn new(page_size: u32, salt: (u32, u32)) -> Self {
        Self {
            page_size,
            salt,
            big_endian: false,
            frames: Vec::new(),
            corrupted: Vec::new(),
        }
    }

    /// Uses big-endian checksums.
    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// Appends a non-commit frame.
    pub fn frame(self, page_number: u32, data: Vec<u8>) -> Self {
        self.push(page_number, 0, data)
    }

    /// Appends a commit frame; `db_size` is the database size in pages
    /// after the transaction.
    pub fn commit(self, page_number: u32, db_size: u32, data: Vec<u8>) -> Self {
        self.push(page_number, db_size, data)
    }

    fn push(mut self, page_number: u32, db_size: u32, mut data: Vec<u8>) -> Self {
        data.resize(self.page_size as usize, 0);
        self.frames.push(Frame {
            page_number,
            db_size,
            data,
        });
        self
    }

    /// Stores a wrong checksum in frame `index` (1-based).
    pub fn corrupt_checksum(mut self, index: usize) -> Self {
        self.corrupted.push(index);
        self
    }

    /// Returns the number of frames added.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frame was added.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Encodes the WAL.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            WAL_HEADER_SIZE + self.frames.len() * (WAL_FRAME_HEADER_SIZE + self.page_size as usize),
        );
        let magic = if self.big_endian { WAL_MAGIC_BE } else { WAL_MAGIC_LE };
        out.extend_from_slice(&magic.to_be_bytes());
        out.extend_from_slice(&WAL_VERSION.to_be_bytes());
        out.extend_from_slice(&self.page_size.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.salt.0.to_be_bytes());
        out.extend_from_slice(&self.salt.1.to_be_bytes());
        let mut checksum = wal_checksum(&out[..24], self.big_endian, (0, 0));
        out.extend_from_slice(&checksum.0.to_be_bytes());
        out.extend_from_slice(&checksum.1.to_be_bytes());

        for (position, frame) in self.frames.iter().enumerate() {
            let mut header = Vec::with_capacity(WAL_FRAME_HEADER_SIZE);
            header.extend_from_slice(&frame.page_number.to_be_bytes());
            header.extend_from_slice(&frame.db_size.to_be_bytes());
            header.extend_from_slice(&self.salt.0.to_be_bytes());
            header.extend_from_slice(&self.salt.1.to_be_bytes());

            checksum = wal_checksum(&header[..8], self.big_endian, checksum);
            checksum = wal_checksum(&frame.data, self.big_endian, checksum);
            let stored = if self.corrupted.contains(&(position + 1)) {
                (checksum.0 ^ 0xdead_beef, checksum.1)
            } else {
                checksum
            };
            header.extend_from_slice(&stored.0.to_be_bytes());
            header.extend_from_slice(&stored.1.to_be_bytes());

            out.extend_from_slice(&header);
            out.extend_from_slice(&frame.data);
        }
        out
    }
}

/// Builds an SHM file image.
pub struct ShmBuilder {
    page_size: u32,
    salt: (u32, u32),
    max_frame: u32,
    page_count: u32,
    backfill: u32,
}

impl ShmBuilder {
    /// Starts an index for a WAL with `salt`.
    pub fn new(page_size: u32, salt: (u32, u32)) -> Self {
        Self {
            page_size,
            salt,
            max_frame: 0,
            page_count: 0,
            backfill: 0,
        }
    }

    /// Sets the claimed max frame.
    pub fn max_frame(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Sets the claimed database size.
    pub fn page_count(mut self, page_count: u32) -> Self {
        self.page_count = page_count;
        self
    }

    /// Sets the number of frames already copied into the database.
    pub fn backfill(mut self, backfill: u32) -> Self {
        self.backfill = backfill;
        self
    }

    /// Encodes both header copies and the checkpoint info.
    pub fn build(&self) -> Vec<u8> {
        let mut header = vec![0u8; SHM_HEADER_SIZE];
        header[0..4].copy_from_slice(&WAL_VERSION.to_ne_bytes());
        header[8..12].copy_from_slice(&1u32.to_ne_bytes());
        header[12] = 1;
        let raw_page_size = if self.page_size == 65536 {
            1
        } else {
            u16::try_from(self.page_size).expect("page size does not fit the index")
        };
        header[14..16].copy_from_slice(&raw_page_size.to_ne_bytes());
        header[16..20].copy_from_slice(&self.max_frame.to_ne_bytes());
        header[20..24].copy_from_slice(&self.page_count.to_ne_bytes());
        header[32..36].copy_from_slice(&self.salt.0.to_ne_bytes());
        header[36..40].copy_from_slice(&self.salt.1.to_ne_bytes());
        let checksum = native_checksum(&header[..40]);
        header[40..44].copy_from_slice(&checksum.0.to_ne_bytes());
        header[44..48].copy_from_slice(&checksum.1.to_ne_bytes());

        let mut out = Vec::with_capacity(32 * 1024);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.backfill.to_ne_bytes());
        out.resize(32 * 1024, 0);
        out
    }
}

/// Returns the page numbers whose bytes differ between two database
/// images, including pages only `after` has.
pub fn changed_pages(before: &[u8], after: &[u8], page_size: usize) -> Vec<u32> {
    after
        .chunks(page_size)
        .enumerate()
        .filter(|(index, page)| before.chunks(page_size).nth(*index) != Some(*page))
        .map(|(index, _)| index as u32 + 1)
        .collect()
}
