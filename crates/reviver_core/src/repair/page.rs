//! B-tree page interpretation.

use crate::error::{CoreError, CoreResult};
use crate::repair::deserialize::{be_u16, be_u32};

/// Size of the database file header that precedes page 1's B-tree header.
pub const DATABASE_HEADER_SIZE: usize = 100;

/// Kind of a B-tree page, from its first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Flag 2.
    InteriorIndex,
    /// Flag 5.
    InteriorTable,
    /// Flag 10.
    LeafIndex,
    /// Flag 13.
    LeafTable,
    /// Anything else: overflow, freelist, zeroed or garbage.
    Unknown(u8),
}

impl PageType {
    /// Maps a header flag to a page type.
    #[must_use]
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            2 => Self::InteriorIndex,
            5 => Self::InteriorTable,
            10 => Self::LeafIndex,
            13 => Self::LeafTable,
            other => Self::Unknown(other),
        }
    }

    /// Returns true for interior pages.
    #[must_use]
    pub fn is_interior(self) -> bool {
        matches!(self, Self::InteriorIndex | Self::InteriorTable)
    }

    /// Returns true for leaf pages.
    #[must_use]
    pub fn is_leaf(self) -> bool {
        matches!(self, Self::LeafIndex | Self::LeafTable)
    }

    /// Returns true for table B-tree pages.
    #[must_use]
    pub fn is_table(self) -> bool {
        matches!(self, Self::InteriorTable | Self::LeafTable)
    }
}

/// One page-sized block read from the database.
///
/// Pages are transient: they are read on demand and dropped after their
/// cells have been copied out.
#[derive(Debug, Clone)]
pub struct Page {
    number: u32,
    data: Vec<u8>,
    usable_size: usize,
}

impl Page {
    /// Wraps raw page bytes.
    #[must_use]
    pub fn new(number: u32, data: Vec<u8>, usable_size: usize) -> Self {
        let usable_size = usable_size.min(data.len());
        Self {
            number,
            data,
            usable_size,
        }
    }

    /// Returns the 1-based page number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the raw bytes, including reserved space.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the bytes cells may occupy.
    #[must_use]
    pub fn usable(&self) -> &[u8] {
        &self.data[..self.usable_size]
    }

    /// Returns the usable size in bytes.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    /// Offset of the B-tree header within the page.
    #[must_use]
    pub fn header_offset(&self) -> usize {
        if self.number == 1 {
            DATABASE_HEADER_SIZE
        } else {
            0
        }
    }

    /// Returns the page type.
    #[must_use]
    pub fn page_type(&self) -> PageType {
        self.data
            .get(self.header_offset())
            .map_or(PageType::Unknown(0), |&flag| PageType::from_flag(flag))
    }

    fn header_size(&self) -> usize {
        if self.page_type().is_interior() {
            12
        } else {
            8
        }
    }

    /// Returns the number of cells.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the header is cut off.
    pub fn cell_count(&self) -> CoreResult<usize> {
        Ok(usize::from(be_u16(self.usable(), self.header_offset() + 3)?))
    }

    /// Returns the byte offset of every cell, in key order.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the pointer array runs past the page
    /// or a pointer lands inside the header.
    pub fn cell_pointers(&self) -> CoreResult<Vec<usize>> {
        let count = self.cell_count()?;
        let array_start = self.header_offset() + self.header_size();
        let content_floor = array_start + count * 2;
        if content_floor > self.usable_size {
            return Err(CoreError::corruption(format!(
                "page {}: {count} cell pointers overflow the page",
                self.number
            )));
        }

        let mut pointers = Vec::with_capacity(count);
        for i in 0..count {
            let pointer = usize::from(be_u16(self.usable(), array_start + i * 2)?);
            if pointer < content_floor || pointer >= self.usable_size {
                return Err(CoreError::corruption(format!(
                    "page {}: cell pointer {pointer} out of range",
                    self.number
                )));
            }
            pointers.push(pointer);
        }
        Ok(pointers)
    }

    /// Returns the right-most child of an interior page.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for leaf pages or a cut-off header.
    pub fn right_most_pointer(&self) -> CoreResult<u32> {
        if !self.page_type().is_interior() {
            return Err(CoreError::corruption(format!(
                "page {} is not interior",
                self.number
            )));
        }
        be_u32(self.usable(), self.header_offset() + 8)
    }

    /// Returns every child page of an interior page, left to right.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the page is not interior or a child
    /// pointer cannot be read.
    pub fn children(&self) -> CoreResult<Vec<u32>> {
        let mut children = self
            .cell_pointers()?
            .into_iter()
            .map(|offset| be_u32(self.usable(), offset))
            .collect::<CoreResult<Vec<_>>>()?;
        children.push(self.right_most_pointer()?);
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interior_page(children: &[u32], right: u32) -> Page {
        let mut data = vec![0u8; 512];
        data[0] = 5;
        data[3..5].copy_from_slice(&(children.len() as u16).to_be_bytes());
        data[8..12].copy_from_slice(&right.to_be_bytes());
        let mut content = 512;
        for (i, child) in children.iter().enumerate() {
            content -= 8;
            data[content..content + 4].copy_from_slice(&child.to_be_bytes());
            data[content + 4] = (i + 1) as u8; // rowid key varint
            let slot = 12 + i * 2;
            data[slot..slot + 2].copy_from_slice(&(content as u16).to_be_bytes());
        }
        Page::new(7, data, 512)
    }

    #[test]
    fn interior_children_in_order() {
        let page = interior_page(&[3, 4], 9);
        assert_eq!(page.page_type(), PageType::InteriorTable);
        assert_eq!(page.children().unwrap(), vec![3, 4, 9]);
    }

    #[test]
    fn zeroed_page_is_unknown() {
        let page = Page::new(2, vec![0u8; 512], 512);
        assert_eq!(page.page_type(), PageType::Unknown(0));
        assert!(page.right_most_pointer().is_err());
    }

    #[test]
    fn page_one_header_offset() {
        let mut data = vec![0u8; 512];
        data[100] = 13;
        let page = Page::new(1, data, 512);
        assert_eq!(page.page_type(), PageType::LeafTable);
        assert_eq!(page.cell_count().unwrap(), 0);
    }

    #[test]
    fn bad_cell_pointer_is_corruption() {
        let mut page = interior_page(&[3], 9);
        page.data[12..14].copy_from_slice(&2u16.to_be_bytes());
        assert!(page.cell_pointers().is_err());
    }
}
