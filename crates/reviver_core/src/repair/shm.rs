//! Shared-memory wal-index header.
//!
//! The `-shm` file starts with two copies of a 48-byte header followed by
//! the checkpoint info block. All fields use the host byte order, since the
//! file is only ever shared between processes on one machine.
//!
//! ```text
//! 0   iVersion      u32
//! 4   unused        u32
//! 8   iChange       u32
//! 12  isInit        u8
//! 13  bigEndCksum   u8
//! 14  szPage        u16
//! 16  mxFrame       u32
//! 20  nPage         u32
//! 24  aFrameCksum   u32 x2
//! 32  aSalt         u32 x2
//! 40  aCksum        u32 x2
//! 48  second copy of the above
//! 96  nBackfill     u32
//! ```

use crate::error::{CoreError, CoreResult};
use crate::repair::checksum::native_checksum;
use reviver_storage::StorageBackend;

/// Size of one wal-index header copy.
pub const SHM_HEADER_SIZE: usize = 48;

/// Bytes that must be present to read both copies and `nBackfill`.
pub const SHM_MIN_SIZE: usize = 2 * SHM_HEADER_SIZE + 4;

/// The decoded wal-index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmHeader {
    /// Wal-index format version.
    pub version: u32,
    /// Change counter.
    pub change: u32,
    /// Page size recorded by the last writer.
    pub page_size: u32,
    /// Last valid frame known to the index.
    pub max_frame: u32,
    /// Database size in pages.
    pub page_count: u32,
    /// Salts of the WAL generation the index describes.
    pub salt: (u32, u32),
}

/// A parsed `-shm` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shm {
    header: ShmHeader,
    backfill: u32,
}

fn ne_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

impl Shm {
    /// Reads and validates the wal-index header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the file is too short, the two
    /// header copies disagree, the header is not initialised, or its
    /// checksum does not match.
    pub fn parse(backend: &dyn StorageBackend) -> CoreResult<Self> {
        let data = backend.read_up_to(0, SHM_MIN_SIZE)?;
        if data.len() < SHM_MIN_SIZE {
            return Err(CoreError::corruption(format!(
                "shm too short: {} bytes",
                data.len()
            )));
        }

        let first = &data[..SHM_HEADER_SIZE];
        let second = &data[SHM_HEADER_SIZE..2 * SHM_HEADER_SIZE];
        if first != second {
            return Err(CoreError::corruption("shm header copies differ"));
        }
        if first[12] == 0 {
            return Err(CoreError::corruption("shm header is not initialised"));
        }

        let (c1, c2) = native_checksum(&first[..40]);
        let (s1, s2) = (ne_u32(first, 40), ne_u32(first, 44));
        if (c1, c2) != (s1, s2) {
            return Err(CoreError::ChecksumMismatch {
                expected: s1,
                actual: c1,
            });
        }

        let raw_page_size = u16::from_ne_bytes([first[14], first[15]]);
        let page_size = if raw_page_size == 1 {
            65536
        } else {
            u32::from(raw_page_size)
        };

        Ok(Self {
            header: ShmHeader {
                version: ne_u32(first, 0),
                change: ne_u32(first, 8),
                page_size,
                max_frame: ne_u32(first, 16),
                page_count: ne_u32(first, 20),
                salt: (ne_u32(first, 32), ne_u32(first, 36)),
            },
            backfill: ne_u32(&data, 2 * SHM_HEADER_SIZE),
        })
    }

    /// Returns the decoded header.
    #[must_use]
    pub fn header(&self) -> &ShmHeader {
        &self.header
    }

    /// Returns the largest frame the index acknowledges.
    #[must_use]
    pub fn max_frame(&self) -> u32 {
        self.header.max_frame
    }

    /// Returns the WAL salts recorded in the index.
    #[must_use]
    pub fn salt(&self) -> (u32, u32) {
        self.header.salt
    }

    /// Returns the number of frames already copied back into the database.
    #[must_use]
    pub fn backfill(&self) -> u32 {
        self.backfill
    }
}
