//! Big-endian cursor and varint codec for page bytes.

use crate::error::{CoreError, CoreResult};

/// Decodes a SQLite varint from the start of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` if
/// `data` ends inside the varint.
#[must_use]
pub fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().take(9).enumerate() {
        if i == 8 {
            return Some(((value << 8) | u64::from(byte), 9));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encodes `value` as a SQLite varint.
#[must_use]
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value & (0xff00_0000_u64 << 32) != 0 {
        let mut out = [0u8; 9];
        out[8] = value as u8;
        let mut rest = value >> 8;
        for byte in out[..8].iter_mut().rev() {
            *byte = ((rest & 0x7f) as u8) | 0x80;
            rest >>= 7;
        }
        return out.to_vec();
    }

    let mut out = Vec::with_capacity(9);
    let mut rest = value;
    loop {
        out.push(((rest & 0x7f) as u8) | 0x80);
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    out[0] &= 0x7f;
    out.reverse();
    out
}

/// Reads a big-endian `u16` at `offset`.
///
/// # Errors
///
/// Returns a corruption error if the slice is too short.
pub fn be_u16(data: &[u8], offset: usize) -> CoreResult<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated("u16", offset))
}

/// Reads a big-endian `u32` at `offset`.
///
/// # Errors
///
/// Returns a corruption error if the slice is too short.
pub fn be_u32(data: &[u8], offset: usize) -> CoreResult<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated("u32", offset))
}

fn truncated(what: &str, offset: usize) -> CoreError {
    CoreError::corruption(format!("unexpected end of data reading {what} at offset {offset}"))
}

/// A forward-only reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Deserializer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Deserializer<'a> {
    /// Creates a reader positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Returns the current offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves to `position`, clamped to the end of the data.
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Returns true when every byte has been read.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn read_u8(&mut self) -> CoreResult<u8> {
        let byte = *self
            .data
            .get(self.position)
            .ok_or_else(|| truncated("u8", self.position))?;
        self.position += 1;
        Ok(byte)
    }

    /// Reads a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn read_u16(&mut self) -> CoreResult<u16> {
        let value = be_u16(self.data, self.position)?;
        self.position += 2;
        Ok(value)
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn read_u32(&mut self) -> CoreResult<u32> {
        let value = be_u32(self.data, self.position)?;
        self.position += 4;
        Ok(value)
    }

    /// Reads a varint.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the data ends inside the varint.
    pub fn read_varint(&mut self) -> CoreResult<u64> {
        let (value, len) = decode_varint(&self.data[self.position..])
            .ok_or_else(|| truncated("varint", self.position))?;
        self.position += len;
        Ok(value)
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| truncated("bytes", self.position))?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Reads a sign-extended big-endian integer of `width` bytes (1..=8).
    ///
    /// # Errors
    ///
    /// Returns a corruption error if fewer than `width` bytes remain.
    pub fn read_int(&mut self, width: usize) -> CoreResult<i64> {
        let bytes = self.read_bytes(width)?;
        let mut value: i64 = if bytes.first().is_some_and(|b| b & 0x80 != 0) {
            -1
        } else {
            0
        };
        for &byte in bytes {
            value = (value << 8) | i64::from(byte);
        }
        Ok(value)
    }

    /// Reads a big-endian IEEE 754 double.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if fewer than 8 bytes remain.
    pub fn read_f64(&mut self) -> CoreResult<f64> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_be_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encode_varint(0), vec![0x00]);
        assert_eq!(encode_varint(0x7f), vec![0x7f]);
        assert_eq!(encode_varint(0x80), vec![0x81, 0x00]);
        assert_eq!(encode_varint(u64::MAX).len(), 9);
        assert_eq!(decode_varint(&[0x81, 0x00]), Some((0x80, 2)));
    }

    #[test]
    fn varint_truncated() {
        assert_eq!(decode_varint(&[0x81]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[test]
    fn read_int_sign_extends() {
        let mut d = Deserializer::new(&[0xff, 0xfe, 0x00, 0x01, 0x00]);
        assert_eq!(d.read_int(2).unwrap(), -2);
        assert_eq!(d.read_int(3).unwrap(), 0x0100);
        assert!(d.is_ended());
        assert!(d.read_int(1).is_err());
    }

    #[test]
    fn read_bytes_past_end_fails_without_advancing() {
        let mut d = Deserializer::new(&[1, 2, 3]);
        d.seek(1);
        assert!(d.read_bytes(3).is_err());
        assert_eq!(d.position(), 1);
        assert_eq!(d.read_bytes(2).unwrap(), &[2, 3]);
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let encoded = encode_varint(value);
            prop_assert_eq!(decode_varint(&encoded), Some((value, encoded.len())));
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..16)) {
            if let Some((_, len)) = decode_varint(&bytes) {
                prop_assert!(len <= bytes.len() && len <= 9);
            }
        }
    }
}
