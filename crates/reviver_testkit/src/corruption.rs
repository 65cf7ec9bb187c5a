//! Deliberate damage to database files.
//!
//! Every helper edits the file in place and assumes no connection holds
//! the database open.

use std::fs;
use std::path::Path;

/// Returns the page size recorded in the header of the file at `path`.
pub fn page_size(path: &Path) -> usize {
    let data = fs::read(path).expect("Failed to read database");
    match u16::from_be_bytes([data[16], data[17]]) {
        1 => 65536,
        size => usize::from(size),
    }
}

fn page_range(path: &Path, page: u32) -> std::ops::Range<usize> {
    assert!(page >= 1, "pages are numbered from 1");
    let size = page_size(path);
    let start = (page as usize - 1) * size;
    start..start + size
}

/// Returns the bytes of `page`.
pub fn read_page(path: &Path, page: u32) -> Vec<u8> {
    let range = page_range(path, page);
    let data = fs::read(path).expect("Failed to read database");
    data[range].to_vec()
}

/// Replaces the bytes of `page`.
pub fn write_page(path: &Path, page: u32, bytes: &[u8]) {
    let range = page_range(path, page);
    assert_eq!(bytes.len(), range.len(), "page image has the wrong size");
    let mut data = fs::read(path).expect("Failed to read database");
    data[range].copy_from_slice(bytes);
    fs::write(path, data).expect("Failed to write database");
}

/// Fills `page` with zeros.
pub fn zero_page(path: &Path, page: u32) {
    let size = page_size(path);
    write_page(path, page, &vec![0; size]);
}

/// Inverts the byte at `offset` of any file.
pub fn flip_byte(path: &Path, offset: usize) {
    let mut data = fs::read(path).expect("Failed to read file");
    data[offset] ^= 0xff;
    fs::write(path, data).expect("Failed to write file");
}

/// Truncates any file to `len` bytes.
pub fn truncate_file(path: &Path, len: u64) {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("Failed to open file");
    file.set_len(len).expect("Failed to truncate file");
}

fn header_offset(page: u32) -> usize {
    if page == 1 {
        100
    } else {
        0
    }
}

/// Rewrites the left child of cell `cell` on the interior table page
/// `page` to point at `target`.
pub fn point_child_at(path: &Path, page: u32, cell: usize, target: u32) {
    let mut bytes = read_page(path, page);
    let header = header_offset(page);
    assert_eq!(bytes[header], 0x05, "page {page} is not an interior table page");
    let cells = usize::from(u16::from_be_bytes([bytes[header + 3], bytes[header + 4]]));
    assert!(cell < cells, "page {page} has only {cells} cells");

    let pointer = header + 12 + cell * 2;
    let offset = usize::from(u16::from_be_bytes([bytes[pointer], bytes[pointer + 1]]));
    bytes[offset..offset + 4].copy_from_slice(&target.to_be_bytes());
    write_page(path, page, &bytes);
}

/// Rewrites the right-most pointer of the interior page `page`.
pub fn point_right_most_at(path: &Path, page: u32, target: u32) {
    let mut bytes = read_page(path, page);
    let header = header_offset(page);
    assert!(
        matches!(bytes[header], 0x02 | 0x05),
        "page {page} is not an interior page"
    );
    bytes[header + 8..header + 12].copy_from_slice(&target.to_be_bytes());
    write_page(path, page, &bytes);
}

/// Returns the child page numbers of the interior table page `page`, the
/// right-most pointer last.
pub fn children(path: &Path, page: u32) -> Vec<u32> {
    let bytes = read_page(path, page);
    let header = header_offset(page);
    if bytes[header] != 0x05 {
        return Vec::new();
    }
    let be = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let cells = usize::from(u16::from_be_bytes([bytes[header + 3], bytes[header + 4]]));
    let mut children: Vec<u32> = (0..cells)
        .map(|cell| {
            let pointer = header + 12 + cell * 2;
            be(usize::from(u16::from_be_bytes([bytes[pointer], bytes[pointer + 1]])))
        })
        .collect();
    children.push(be(header + 8));
    children
}
