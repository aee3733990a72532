//! # Storage Module
//!
//! The foundational storage layer: one database file made of fixed 4096-byte
//! pages behind a 64-byte file header, plus a write-ahead log sidecar.
//!
//! ## File Layout
//!
//! ```text
//! mydb                      # data file
//! +--------------------+
//! | File header (64B)  |
//! +--------------------+
//! | Page 0 (4096B)     |   <- meta page
//! +--------------------+
//! | Page 1 (4096B)     |
//! | ...                |
//! +--------------------+
//!
//! mydb.wal                  # write-ahead log
//! ```
//!
//! Invariant: `file_size == 64 + page_count * 4096`.
//!
//! ## File Header Layout (64 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ---------------------------------
//! 0       4     magic            0x4D4F4E4F ("MONO")
//! 4       2     version          Format version, currently 1
//! 6       2     page_size        4096
//! 8       4     page_count       Total pages in the file
//! 12      4     free_list_head   First free page (0 = empty list)
//! 16      4     meta_page_id     Meta page (page 0)
//! 20      4     catalog_page_id  Catalog page (0 = no collections)
//! 24      8     created_at       Creation time, unix millis
//! 32      8     modified_at      Last flush time, unix millis
//! 40      24    reserved
//! ```
//!
//! ## Durability Model
//!
//! Every mutation is WAL-first: the log record (and, for structural
//! mutations, an fsync) precedes the data-file write. Recovery replays log
//! records past the last checkpoint, so the data file is never the sole
//! authority for recent writes. See `wal` and `pager`.
//!
//! ## Module Organization
//!
//! - `page`: page frame, header, XOR checksum, marshal/unmarshal
//! - `slotted`: variable-length record directory within a data page
//! - `wal`: append-only redo log with CRC'd records and checkpoints
//! - `cache`: bounded read cache over unmarshaled pages
//! - `pager`: file ownership, allocation, free-list, recovery

mod cache;
mod page;
mod pager;
mod slotted;
mod wal;

pub use cache::PageCache;
pub use page::{checksum_data, Page, PageHeader, PageType};
pub use pager::{Pager, PagerOptions};
pub use slotted::{SlottedPage, SLOT_SIZE};
pub use wal::{
    MetaField, RecordType, Wal, WalRecord, WAL_AUTO_TRUNCATE_THRESHOLD, WAL_HEADER_SIZE, WAL_MAGIC,
    WAL_RECORD_HEADER_SIZE,
};

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
pub const FILE_HEADER_SIZE: usize = 64;

pub const FILE_MAGIC: u32 = 0x4D4F_4E4F;
pub const CURRENT_VERSION: u16 = 1;

/// The fixed 64-byte prefix of the data file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: U32,
    version: U16,
    page_size: U16,
    page_count: U32,
    free_list_head: U32,
    meta_page_id: U32,
    catalog_page_id: U32,
    created_at: U64,
    modified_at: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(now_millis: u64) -> Self {
        Self {
            magic: U32::new(FILE_MAGIC),
            version: U16::new(CURRENT_VERSION),
            page_size: U16::new(PAGE_SIZE as u16),
            page_count: U32::new(0),
            free_list_head: U32::new(0),
            meta_page_id: U32::new(0),
            catalog_page_id: U32::new(0),
            created_at: U64::new(now_millis),
            modified_at: U64::new(now_millis),
            reserved: [0u8; 24],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == FILE_MAGIC,
            "invalid magic bytes in database file: 0x{:08X}",
            header.magic.get()
        );
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported format version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        ensure!(
            header.page_size.get() as usize == PAGE_SIZE,
            "unsupported page size: {} (expected {})",
            header.page_size.get(),
            PAGE_SIZE
        );

        Ok(header)
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u32) {
        self.page_count = U32::new(count);
    }

    pub fn free_list_head(&self) -> u32 {
        self.free_list_head.get()
    }

    pub fn set_free_list_head(&mut self, page_id: u32) {
        self.free_list_head = U32::new(page_id);
    }

    pub fn meta_page_id(&self) -> u32 {
        self.meta_page_id.get()
    }

    pub fn set_meta_page_id(&mut self, page_id: u32) {
        self.meta_page_id = U32::new(page_id);
    }

    pub fn catalog_page_id(&self) -> u32 {
        self.catalog_page_id.get()
    }

    pub fn set_catalog_page_id(&mut self, page_id: u32) {
        self.catalog_page_id = U32::new(page_id);
    }

    pub fn created_at(&self) -> u64 {
        self.created_at.get()
    }

    pub fn modified_at(&self) -> u64 {
        self.modified_at.get()
    }

    pub fn set_modified_at(&mut self, millis: u64) {
        self.modified_at = U64::new(millis);
    }

    pub fn version(&self) -> u16 {
        self.version.get()
    }
}

/// Byte offset of a page within the data file.
pub fn page_offset(page_id: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_size_is_64() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 64);
    }

    #[test]
    fn file_header_roundtrip() {
        let mut header = FileHeader::new(1234);
        header.set_page_count(10);
        header.set_free_list_head(3);
        header.set_catalog_page_id(5);

        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();

        assert_eq!(parsed.version(), CURRENT_VERSION);
        assert_eq!(parsed.page_count(), 10);
        assert_eq!(parsed.free_list_head(), 3);
        assert_eq!(parsed.catalog_page_id(), 5);
        assert_eq!(parsed.created_at(), 1234);
    }

    #[test]
    fn file_header_rejects_bad_magic() {
        let mut bytes = [0u8; 64];
        bytes[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn file_header_rejects_bad_version() {
        let header = FileHeader::new(0);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(header.as_bytes());
        bytes[4] = 99;

        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn page_offsets_are_contiguous() {
        assert_eq!(page_offset(0), 64);
        assert_eq!(page_offset(1), 64 + 4096);
        assert_eq!(page_offset(2) - page_offset(1), 4096);
    }
}
