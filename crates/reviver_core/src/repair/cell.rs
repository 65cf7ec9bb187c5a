//! Row cells of table B-tree leaves.
//!
//! A cell is decoded as far as its bytes allow. When the payload is cut
//! short (the declared size runs past the page, an overflow page is lost,
//! or the overflow chain loops) every fully available column is kept and
//! the rest are counted in [`Cell::missing_columns`].

use crate::error::{CoreError, CoreResult};
use crate::repair::deserialize::{be_u32, decode_varint, Deserializer};
use crate::repair::page::{Page, PageType};
use crate::repair::pager::Pager;
use crate::repair::value::{SerialType, Value};
use std::collections::HashSet;

/// Number of payload bytes stored on the page itself.
///
/// Implements the spill rule shared by table and index B-trees, with
/// `usable` the usable page size.
#[must_use]
pub fn local_payload_size(payload: u64, usable: usize, table_leaf: bool) -> usize {
    let usable = usable as u64;
    let max_local = if table_leaf {
        usable - 35
    } else {
        (usable - 12) * 64 / 255 - 23
    };
    let min_local = (usable - 12) * 32 / 255 - 23;
    if payload <= max_local {
        return payload as usize;
    }
    let spill = min_local + (payload - min_local) % (usable - 4);
    if spill <= max_local {
        spill as usize
    } else {
        min_local as usize
    }
}

/// A decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    page: u32,
    rowid: i64,
    values: Vec<Value>,
    missing_columns: usize,
    truncated: bool,
}

impl Cell {
    /// Decodes the table-leaf cell at `offset` of `page`.
    ///
    /// Overflow pages are read through `pager`; a repeated overflow page is
    /// marked as corrupted.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the page is not a table leaf or not
    /// even one column can be decoded.
    pub fn parse(pager: &mut Pager, page: &Page, offset: usize) -> CoreResult<Self> {
        if page.page_type() != PageType::LeafTable {
            return Err(CoreError::corruption(format!(
                "page {} is not a table leaf",
                page.number()
            )));
        }

        let usable = page.usable();
        let mut reader = Deserializer::new(usable);
        reader.seek(offset);
        let payload_size = reader.read_varint()?;
        let rowid = reader.read_varint()? as i64;

        let local = local_payload_size(payload_size, page.usable_size(), true);
        let start = reader.position();
        let available = local.min(usable.len() - start);
        let mut payload = usable[start..start + available].to_vec();
        let mut truncated = available < local;

        if !truncated && payload_size > local as u64 {
            let remaining = payload_size - local as u64;
            truncated = match be_u32(usable, start + local) {
                Ok(first) => !read_overflow(pager, first, remaining, &mut payload),
                Err(_) => true,
            };
        }

        let (values, missing_columns) = decode_record(&payload)?;
        Ok(Self {
            page: page.number(),
            rowid,
            values,
            missing_columns,
            truncated: truncated || missing_columns > 0,
        })
    }

    /// Builds a complete row.
    #[must_use]
    pub fn new(page: u32, rowid: i64, values: Vec<Value>) -> Self {
        Self {
            page,
            rowid,
            values,
            missing_columns: 0,
            truncated: false,
        }
    }

    /// Returns the page the cell was read from.
    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Returns the rowid.
    #[must_use]
    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    /// Returns the decoded columns.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the cell and returns its columns.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of declared columns that could not be decoded.
    #[must_use]
    pub fn missing_columns(&self) -> usize {
        self.missing_columns
    }

    /// Returns the number of columns the record header declares, as far
    /// as it could be read.
    #[must_use]
    pub fn declared_columns(&self) -> usize {
        self.values.len() + self.missing_columns
    }

    /// Returns true if part of the payload was unavailable.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

fn read_overflow(pager: &mut Pager, first: u32, mut remaining: u64, payload: &mut Vec<u8>) -> bool {
    let chunk = pager.usable_size() - 4;
    let mut visited = HashSet::new();
    let mut next = first;

    while remaining > 0 {
        if next == 0 {
            return false;
        }
        if !visited.insert(next) {
            pager.mark_as_corrupted(next, "redundant overflow page");
            return false;
        }
        let Ok(data) = pager.acquire_data(next) else {
            return false;
        };
        let take = (remaining.min(chunk as u64)) as usize;
        payload.extend_from_slice(&data[4..4 + take]);
        remaining -= take as u64;
        next = be_u32(&data, 0).unwrap_or(0);
    }
    true
}

/// Decodes a record, returning the decodable columns and the number of
/// declared columns that could not be read.
///
/// # Errors
///
/// Returns a corruption error when the header size cannot be read or no
/// column at all can be decoded.
pub fn decode_record(payload: &[u8]) -> CoreResult<(Vec<Value>, usize)> {
    let (header_size, header_len) = decode_varint(payload)
        .ok_or_else(|| CoreError::corruption("record header size is cut off"))?;
    let header_size = usize::try_from(header_size)
        .ok()
        .filter(|&size| size >= header_len)
        .ok_or_else(|| CoreError::corruption("record header size is invalid"))?;

    let header_end = header_size.min(payload.len());
    let mut codes = Vec::new();
    let mut position = header_len;
    while position < header_end {
        match decode_varint(&payload[position..header_end]) {
            Some((code, len)) => {
                codes.push(code);
                position += len;
            }
            None => break,
        }
    }

    let mut body = Deserializer::new(payload);
    body.seek(header_size);
    let mut values = Vec::with_capacity(codes.len());
    for &code in &codes {
        let Ok(serial_type) = SerialType::from_code(code) else {
            break;
        };
        match serial_type.read(&mut body) {
            Ok(value) => values.push(value),
            Err(_) => break,
        }
    }

    if values.is_empty() && !codes.is_empty() {
        return Err(CoreError::corruption("no column of the record is decodable"));
    }
    if codes.is_empty() {
        return Err(CoreError::corruption("record declares no columns"));
    }
    let missing = codes.len() - values.len();
    Ok((values, missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::deserialize::encode_varint;
    use crate::repair::pager::{PagerOptions, DATABASE_MAGIC};
    use proptest::prelude::*;
    use reviver_storage::InMemoryBackend;

    const PAGE: usize = 1024;

    fn record(values: &[Value]) -> Vec<u8> {
        let mut codes = Vec::new();
        let mut body = Vec::new();
        for value in values {
            match value {
                Value::Null => codes.extend(encode_varint(0)),
                Value::Integer(v) => {
                    codes.extend(encode_varint(6));
                    body.extend_from_slice(&v.to_be_bytes());
                }
                Value::Real(v) => {
                    codes.extend(encode_varint(7));
                    body.extend_from_slice(&v.to_be_bytes());
                }
                Value::Text(t) => {
                    codes.extend(encode_varint(13 + 2 * t.len() as u64));
                    body.extend_from_slice(t);
                }
                Value::Blob(b) => {
                    codes.extend(encode_varint(12 + 2 * b.len() as u64));
                    body.extend_from_slice(b);
                }
            }
        }
        let mut out = encode_varint(codes.len() as u64 + 1);
        out.extend(codes);
        out.extend(body);
        out
    }

    /// Builds a 3-page database whose page 2 holds one cell.
    fn leaf_with_cell(cell: &[u8]) -> (Pager, Page) {
        let mut data = vec![0u8; PAGE * 3];
        data[..16].copy_from_slice(DATABASE_MAGIC);
        data[16..18].copy_from_slice(&(PAGE as u16).to_be_bytes());
        data[100] = 13;
        let base = PAGE;
        data[base] = 13;
        data[base + 3..base + 5].copy_from_slice(&1u16.to_be_bytes());
        let offset = PAGE - cell.len().min(PAGE - 16);
        data[base + 8..base + 10].copy_from_slice(&(offset as u16).to_be_bytes());
        let len = cell.len().min(PAGE - offset);
        data[base + offset..base + offset + len].copy_from_slice(&cell[..len]);

        let mut pager = Pager::with_backend(
            Box::new(InMemoryBackend::with_data(data)),
            None,
            &PagerOptions::default(),
        )
        .unwrap();
        let page = pager.acquire_page(2).unwrap();
        (pager, page)
    }

    fn cell_bytes(rowid: u64, payload: &[u8], declared: usize) -> Vec<u8> {
        let mut out = encode_varint(declared as u64);
        out.extend(encode_varint(rowid));
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn local_payload_rules() {
        assert_eq!(local_payload_size(100, 4096, true), 100);
        assert_eq!(local_payload_size(4061, 4096, true), 4061);
        let spilled = local_payload_size(10_000, 4096, true);
        assert!(spilled < 4061 && spilled >= 489);
    }

    #[test]
    fn parses_complete_cell() {
        let values = vec![
            Value::Integer(7),
            Value::Text(b"alice".to_vec()),
            Value::Null,
        ];
        let payload = record(&values);
        let (mut pager, page) = leaf_with_cell(&cell_bytes(42, &payload, payload.len()));
        let offset = page.cell_pointers().unwrap()[0];

        let cell = Cell::parse(&mut pager, &page, offset).unwrap();
        assert_eq!(cell.rowid(), 42);
        assert_eq!(cell.values(), values.as_slice());
        assert_eq!(cell.missing_columns(), 0);
        assert!(!cell.is_truncated());
    }

    #[test]
    fn oversized_payload_yields_partial_row() {
        let values = vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Blob(vec![9; 40]),
            Value::Text(b"tail".to_vec()),
        ];
        let payload = record(&values);
        // Keep the header, both integers and half the blob on the page.
        let cut = payload.len() - 4 - 20;
        let bytes = cell_bytes(5, &payload[..cut], payload.len() + 2000);
        let (mut pager, page) = leaf_with_cell(&bytes);
        let offset = page.cell_pointers().unwrap()[0];

        let cell = Cell::parse(&mut pager, &page, offset).unwrap();
        assert_eq!(cell.values(), &[Value::Integer(1), Value::Integer(2)]);
        assert_eq!(cell.missing_columns(), 2);
        assert_eq!(cell.declared_columns(), 4);
        assert!(cell.is_truncated());
    }

    #[test]
    fn empty_record_is_error() {
        assert!(decode_record(&[]).is_err());
        assert!(decode_record(&[1]).is_err());
    }

    #[test]
    fn reserved_serial_type_stops_decoding() {
        let payload = vec![3, 1, 10, 0x05];
        let (values, missing) = decode_record(&payload).unwrap();
        assert_eq!(values, vec![Value::Integer(5)]);
        assert_eq!(missing, 1);
    }

    proptest! {
        #[test]
        fn decode_record_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            if let Ok((values, missing)) = decode_record(&bytes) {
                prop_assert!(!values.is_empty());
                prop_assert!(values.len() + missing <= bytes.len());
            }
        }
    }
}
