//! Checksums used by WAL frames, SHM headers and materials.

/// Computes the WAL rolling checksum over `data`, continuing from `seed`.
///
/// `data.len()` must be a multiple of 8. Words are read big-endian when
/// `big_endian` is set, little-endian otherwise.
#[must_use]
pub fn wal_checksum(data: &[u8], big_endian: bool, seed: (u32, u32)) -> (u32, u32) {
    debug_assert!(data.len() % 8 == 0, "WAL checksum input must be 8-byte aligned");
    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let (w0, w1) = if big_endian {
            (
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        } else {
            (
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        };
        s1 = s1.wrapping_add(w0).wrapping_add(s2);
        s2 = s2.wrapping_add(w1).wrapping_add(s1);
    }
    (s1, s2)
}

/// Computes the SHM header checksum, which reads words in host order.
#[must_use]
pub fn native_checksum(data: &[u8]) -> (u32, u32) {
    wal_checksum(data, cfg!(target_endian = "big"), (0, 0))
}

/// Computes a CRC32 (IEEE polynomial) over `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
