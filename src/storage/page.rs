//! # Page Frame and Header Layout
//!
//! Every page is a fixed 4096-byte frame: a 24-byte header followed by a
//! 4072-byte data area. Pages are the unit of I/O, caching, WAL redo, and
//! checksum verification.
//!
//! ## Page Header Layout (24 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ----------------------------------------
//! 0       4     id            Page id (position in the file)
//! 4       1     type          Page type (free, meta, data, index, ...)
//! 5       1     flags         Page flags
//! 6       2     item_count    Slot count (data) / entry count (index)
//! 8       2     free_space    Bytes available in the data area
//! 10      4     next_page_id  Forward link (0 = none)
//! 14      4     prev_page_id  Backward link (0 = none)
//! 18      4     checksum      XOR checksum over the data area
//! 22      2     reserved
//! ```
//!
//! ## Page Types
//!
//! - **Free** (0): on the free-list, reusable
//! - **Meta** (1): database metadata (page 0)
//! - **Catalog** (2): serialized collection directory
//! - **Data** (3): slotted document records
//! - **Index** (4): B+tree node
//! - **Overflow** (5): continuation of a record too large for one page
//! - **FreeList** (6): reserved for free-list bookkeeping
//!
//! ## Checksum
//!
//! The checksum is the XOR of the data area read as little-endian 32-bit
//! words, with any trailing bytes zero-padded into a final word. It is
//! computed in `marshal` and verified in `unmarshal`; a mismatch fails the
//! read with a `CorruptPage` kind. The header itself is not covered, so a
//! torn header write surfaces as a type/link inconsistency upstream rather
//! than a checksum failure.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PAGE_DATA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::DbError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free = 0,
    Meta = 1,
    Catalog = 2,
    Data = 3,
    Index = 4,
    Overflow = 5,
    FreeList = 6,
}

impl PageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PageType::Free),
            1 => Some(PageType::Meta),
            2 => Some(PageType::Catalog),
            3 => Some(PageType::Data),
            4 => Some(PageType::Index),
            5 => Some(PageType::Overflow),
            6 => Some(PageType::FreeList),
            _ => None,
        }
    }
}

/// Wire form of the 24-byte page header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U32,
    page_type: u8,
    flags: u8,
    item_count: U16,
    free_space: U16,
    next_page_id: U32,
    prev_page_id: U32,
    checksum: U32,
    reserved: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

/// XOR of consecutive little-endian 32-bit words; a partial trailing word is
/// zero-padded.
pub fn checksum_data(data: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        acc ^= u32::from_le_bytes(chunk.try_into().unwrap());
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; 4];
        word[..tail.len()].copy_from_slice(tail);
        acc ^= u32::from_le_bytes(word);
    }
    acc
}

/// A 4096-byte page held in memory. Header fields live as plain values;
/// the checksum exists only in the marshaled form.
#[derive(Clone, PartialEq)]
pub struct Page {
    id: u32,
    page_type: PageType,
    flags: u8,
    item_count: u16,
    free_space: u16,
    next_page_id: u32,
    prev_page_id: u32,
    data: Box<[u8; PAGE_DATA_SIZE]>,
}

impl Page {
    pub fn new(id: u32, page_type: PageType) -> Self {
        Self {
            id,
            page_type,
            flags: 0,
            item_count: 0,
            free_space: PAGE_DATA_SIZE as u16,
            next_page_id: 0,
            prev_page_id: 0,
            data: Box::new([0u8; PAGE_DATA_SIZE]),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn item_count(&self) -> u16 {
        self.item_count
    }

    pub fn set_item_count(&mut self, count: u16) {
        self.item_count = count;
    }

    pub fn free_space(&self) -> u16 {
        self.free_space
    }

    pub fn set_free_space(&mut self, space: u16) {
        self.free_space = space;
    }

    pub fn next_page_id(&self) -> u32 {
        self.next_page_id
    }

    pub fn set_next_page_id(&mut self, page_id: u32) {
        self.next_page_id = page_id;
    }

    pub fn prev_page_id(&self) -> u32 {
        self.prev_page_id
    }

    pub fn set_prev_page_id(&mut self, page_id: u32) {
        self.prev_page_id = page_id;
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Serializes the page to its 4096-byte wire form, computing the data
    /// checksum into the header.
    pub fn marshal(&self) -> Vec<u8> {
        let header = PageHeader {
            id: U32::new(self.id),
            page_type: self.page_type as u8,
            flags: self.flags,
            item_count: U16::new(self.item_count),
            free_space: U16::new(self.free_space),
            next_page_id: U32::new(self.next_page_id),
            prev_page_id: U32::new(self.prev_page_id),
            checksum: U32::new(checksum_data(&self.data[..])),
            reserved: [0u8; 2],
        };

        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.data[..]);
        buf
    }

    /// Deserializes a 4096-byte frame, verifying length and data checksum.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == PAGE_SIZE,
            DbError::CorruptPage {
                page_id: 0,
                reason: format!("wrong page length: {} != {}", bytes.len(), PAGE_SIZE),
            }
        );

        let header = PageHeader::ref_from_bytes(&bytes[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse PageHeader: {:?}", e))?;
        let id = header.id.get();

        let page_type = PageType::from_byte(header.page_type).ok_or_else(|| DbError::CorruptPage {
            page_id: id,
            reason: format!("invalid page type 0x{:02X}", header.page_type),
        })?;

        let data = &bytes[PAGE_HEADER_SIZE..];
        let computed = checksum_data(data);
        ensure!(
            computed == header.checksum.get(),
            DbError::CorruptPage {
                page_id: id,
                reason: format!(
                    "checksum mismatch: stored 0x{:08X}, computed 0x{:08X}",
                    header.checksum.get(),
                    computed
                ),
            }
        );

        let mut page = Page::new(id, page_type);
        page.flags = header.flags;
        page.item_count = header.item_count.get();
        page.free_space = header.free_space.get();
        page.next_page_id = header.next_page_id.get();
        page.prev_page_id = header.prev_page_id.get();
        page.data.copy_from_slice(data);
        Ok(page)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type)
            .field("item_count", &self.item_count)
            .field("free_space", &self.free_space)
            .field("next", &self.next_page_id)
            .field("prev", &self.prev_page_id)
            .finish()
    }
}
