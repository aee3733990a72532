//! # Slotted Record Layout
//!
//! Variable-length records within a data page. A slot directory grows
//! forward from the start of the data area; record bytes grow backward from
//! the end. The gap between them is the free space.
//!
//! ```text
//! Data area (4072 bytes)
//! +--------------------+----------------+---------------------+
//! | Slot directory     |  free space    |  record heap        |
//! | (6 bytes per slot) |                |  (grows downward)   |
//! +--------------------+----------------+---------------------+
//! 0                    dir_end          low_water             4072
//! ```
//!
//! ## Slot Layout (6 bytes)
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  -----------------------------------
//! 0       2     offset   Record start within the data area
//! 2       2     length   Record length in bytes
//! 4       2     flags    Bit 0 = deleted
//! ```
//!
//! Slot indexes are stable: deletion marks the flag and keeps the entry, so
//! records can be addressed by (page, slot) until `compact` rebuilds the
//! directory and hands back an old-to-new index mapping. Deleted records
//! keep their heap space until compaction; the page header's `free_space`
//! tracks only the gap between the directory and the heap low-water mark.
//!
//! An update that fits the existing record happens in place. A growing
//! update appends a fresh copy to the heap and repoints the same slot,
//! leaking the old bytes until compaction. A growing update that does not
//! fit the gap fails with `PageFull`; records are never relocated to
//! another page from this layer.

use eyre::{ensure, Result};

use super::{Page, PAGE_DATA_SIZE};
use crate::error::DbError;

pub const SLOT_SIZE: usize = 6;

const FLAG_DELETED: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u16,
    length: u16,
    flags: u16,
}

impl Slot {
    fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }
}

/// A view over a page's data area interpreting it as slots plus a record
/// heap. Keeps the page header's `item_count` and `free_space` current.
pub struct SlottedPage<'a> {
    page: &'a mut Page,
}

impl<'a> SlottedPage<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    pub fn slot_count(&self) -> u16 {
        self.page.item_count()
    }

    /// Live (non-deleted) record count.
    pub fn live_count(&self) -> u16 {
        (0..self.slot_count())
            .filter(|&i| !self.slot(i).is_deleted())
            .count() as u16
    }

    fn slot(&self, index: u16) -> Slot {
        let base = index as usize * SLOT_SIZE;
        let data = self.page.data();
        Slot {
            offset: u16::from_le_bytes([data[base], data[base + 1]]),
            length: u16::from_le_bytes([data[base + 2], data[base + 3]]),
            flags: u16::from_le_bytes([data[base + 4], data[base + 5]]),
        }
    }

    fn write_slot(&mut self, index: u16, slot: Slot) {
        let base = index as usize * SLOT_SIZE;
        let data = self.page.data_mut();
        data[base..base + 2].copy_from_slice(&slot.offset.to_le_bytes());
        data[base + 2..base + 4].copy_from_slice(&slot.length.to_le_bytes());
        data[base + 4..base + 6].copy_from_slice(&slot.flags.to_le_bytes());
    }

    fn dir_end(&self) -> usize {
        self.slot_count() as usize * SLOT_SIZE
    }

    /// Lowest record offset across all slots, deleted included. Deleted
    /// records hold their space until compaction.
    fn low_water(&self) -> usize {
        let mut low = PAGE_DATA_SIZE;
        for i in 0..self.slot_count() {
            let slot = self.slot(i);
            low = low.min(slot.offset as usize);
        }
        low
    }

    fn refresh_free_space(&mut self) {
        let space = self.low_water().saturating_sub(self.dir_end());
        self.page.set_free_space(space as u16);
    }

    /// Appends a record, returning its slot index. Zero-length records are
    /// permitted.
    pub fn insert_record(&mut self, record: &[u8]) -> Result<u16> {
        ensure!(
            record.len() <= PAGE_DATA_SIZE - SLOT_SIZE,
            DbError::InvalidArgument(format!(
                "record of {} bytes exceeds page capacity",
                record.len()
            ))
        );

        let new_dir_end = self.dir_end() + SLOT_SIZE;
        let low = self.low_water();
        ensure!(
            new_dir_end + record.len() <= low,
            DbError::PageFull(self.page.id())
        );

        let offset = low - record.len();
        let index = self.slot_count();
        self.page.data_mut()[offset..offset + record.len()].copy_from_slice(record);
        self.page.set_item_count(index + 1);
        self.write_slot(
            index,
            Slot {
                offset: offset as u16,
                length: record.len() as u16,
                flags: 0,
            },
        );
        self.refresh_free_space();
        Ok(index)
    }

    /// Returns the record at a slot, or `None` when the slot is out of
    /// range or deleted.
    pub fn get_record(&self, index: u16) -> Option<&[u8]> {
        if index >= self.slot_count() {
            return None;
        }
        let slot = self.slot(index);
        if slot.is_deleted() {
            return None;
        }
        let start = slot.offset as usize;
        Some(&self.page.data()[start..start + slot.length as usize])
    }

    /// Rewrites the record at a slot. Shrinking or equal-length updates
    /// happen in place; growing updates append to the heap under the same
    /// slot index.
    pub fn update_record(&mut self, index: u16, record: &[u8]) -> Result<()> {
        ensure!(
            index < self.slot_count(),
            DbError::NotFound(format!("slot {} out of range", index))
        );
        let slot = self.slot(index);
        ensure!(
            !slot.is_deleted(),
            DbError::NotFound(format!("slot {} is deleted", index))
        );

        if record.len() <= slot.length as usize {
            let start = slot.offset as usize;
            self.page.data_mut()[start..start + record.len()].copy_from_slice(record);
            self.write_slot(
                index,
                Slot {
                    offset: slot.offset,
                    length: record.len() as u16,
                    flags: slot.flags,
                },
            );
            self.refresh_free_space();
            return Ok(());
        }

        let low = self.low_water();
        ensure!(
            self.dir_end() + record.len() <= low,
            DbError::PageFull(self.page.id())
        );

        let offset = low - record.len();
        self.page.data_mut()[offset..offset + record.len()].copy_from_slice(record);
        self.write_slot(
            index,
            Slot {
                offset: offset as u16,
                length: record.len() as u16,
                flags: slot.flags,
            },
        );
        self.refresh_free_space();
        Ok(())
    }

    /// Marks a slot deleted. Idempotent; out-of-range indexes are a
    /// `NotFound` error.
    pub fn delete_record(&mut self, index: u16) -> Result<()> {
        ensure!(
            index < self.slot_count(),
            DbError::NotFound(format!("slot {} out of range", index))
        );
        let mut slot = self.slot(index);
        slot.flags |= FLAG_DELETED;
        self.write_slot(index, slot);
        Ok(())
    }

    /// Rebuilds the directory with live slots only and packs their records
    /// against the end of the data area. Returns (old_index, new_index)
    /// pairs for every surviving record.
    pub fn compact(&mut self) -> Vec<(u16, u16)> {
        let mut live: Vec<(u16, Vec<u8>)> = Vec::new();
        for i in 0..self.slot_count() {
            let slot = self.slot(i);
            if slot.is_deleted() {
                continue;
            }
            let start = slot.offset as usize;
            live.push((i, self.page.data()[start..start + slot.length as usize].to_vec()));
        }

        // Zero the whole data area so stale directory entries and leaked
        // record bytes cannot survive a marshal.
        self.page.data_mut().fill(0);
        self.page.set_item_count(0);

        let mut mapping = Vec::with_capacity(live.len());
        for (old_index, record) in live {
            let new_index = self
                .insert_record(&record)
                .unwrap_or_else(|_| unreachable!("live records always fit after compaction"));
            mapping.push((old_index, new_index));
        }
        self.refresh_free_space();
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_page_full, kind_of};
    use crate::storage::PageType;

    fn data_page() -> Page {
        Page::new(1, PageType::Data)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);

        let a = slotted.insert_record(b"alpha").unwrap();
        let b = slotted.insert_record(b"bravo").unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(slotted.get_record(0), Some(&b"alpha"[..]));
        assert_eq!(slotted.get_record(1), Some(&b"bravo"[..]));
        assert_eq!(slotted.get_record(2), None);
    }

    #[test]
    fn zero_length_records_are_allowed() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);

        let idx = slotted.insert_record(b"").unwrap();
        assert_eq!(slotted.get_record(idx), Some(&b""[..]));
    }

    #[test]
    fn free_space_shrinks_by_slot_plus_record() {
        let mut page = data_page();
        let initial = page.free_space() as usize;
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"12345678").unwrap();

        assert_eq!(page.free_space() as usize, initial - SLOT_SIZE - 8);
    }

    #[test]
    fn page_full_when_no_room() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);

        let big = vec![0xAB; 2000];
        slotted.insert_record(&big).unwrap();
        slotted.insert_record(&big).unwrap();
        let err = slotted.insert_record(&big).unwrap_err();

        assert!(is_page_full(&err));
    }

    #[test]
    fn oversized_record_is_invalid_argument() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);

        let err = slotted.insert_record(&vec![0u8; PAGE_DATA_SIZE]).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_hides_record_but_keeps_slot_index() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"one").unwrap();
        slotted.insert_record(b"two").unwrap();

        slotted.delete_record(0).unwrap();

        assert_eq!(slotted.get_record(0), None);
        assert_eq!(slotted.get_record(1), Some(&b"two"[..]));
        assert_eq!(slotted.slot_count(), 2);
        assert_eq!(slotted.live_count(), 1);
    }

    #[test]
    fn update_in_place_when_shrinking() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"longer-record").unwrap();
        let low_before = slotted.low_water();

        slotted.update_record(0, b"short").unwrap();

        assert_eq!(slotted.get_record(0), Some(&b"short"[..]));
        assert_eq!(slotted.low_water(), low_before, "shrink must not move the heap");
    }

    #[test]
    fn update_appends_when_growing() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"tiny").unwrap();
        slotted.insert_record(b"other").unwrap();

        slotted.update_record(0, b"a-much-longer-record").unwrap();

        assert_eq!(slotted.get_record(0), Some(&b"a-much-longer-record"[..]));
        assert_eq!(slotted.get_record(1), Some(&b"other"[..]));
    }

    #[test]
    fn growing_update_fails_when_page_is_tight() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(&vec![1u8; 2000]).unwrap();
        slotted.insert_record(&vec![2u8; 2000]).unwrap();

        let err = slotted.update_record(0, &vec![3u8; 2100]).unwrap_err();
        assert!(is_page_full(&err));
        assert_eq!(slotted.get_record(0).unwrap(), &vec![1u8; 2000][..]);
    }

    #[test]
    fn update_of_deleted_slot_is_not_found() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"x").unwrap();
        slotted.delete_record(0).unwrap();

        let err = slotted.update_record(0, b"y").unwrap_err();
        assert!(matches!(kind_of(&err), Some(DbError::NotFound(_))));
    }

    #[test]
    fn compact_reclaims_deleted_space_and_maps_indexes() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"aaaa").unwrap();
        slotted.insert_record(b"bbbb").unwrap();
        slotted.insert_record(b"cccc").unwrap();
        slotted.delete_record(1).unwrap();

        let before: Vec<Vec<u8>> = [0u16, 2]
            .iter()
            .map(|&i| slotted.get_record(i).unwrap().to_vec())
            .collect();
        let free_before = page.free_space();

        let mut slotted = SlottedPage::new(&mut page);
        let mapping = slotted.compact();

        assert_eq!(mapping, vec![(0, 0), (2, 1)]);
        assert_eq!(slotted.slot_count(), 2);
        for (k, &(_, new_index)) in mapping.iter().enumerate() {
            assert_eq!(slotted.get_record(new_index).unwrap(), &before[k][..]);
        }
        assert!(page.free_space() > free_before);
    }

    #[test]
    fn compact_survives_interleaved_updates() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"first").unwrap();
        slotted.insert_record(b"second").unwrap();
        slotted.update_record(0, b"first-grew-past-its-slot").unwrap();
        slotted.delete_record(1).unwrap();

        let mapping = slotted.compact();

        assert_eq!(mapping, vec![(0, 0)]);
        assert_eq!(
            slotted.get_record(0),
            Some(&b"first-grew-past-its-slot"[..])
        );
    }

    #[test]
    fn slotted_state_survives_marshal() {
        let mut page = data_page();
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(b"persisted").unwrap();
        let doomed = slotted.insert_record(b"doomed").unwrap();
        slotted.delete_record(doomed).unwrap();

        let mut restored = Page::unmarshal(&page.marshal()).unwrap();
        let slotted = SlottedPage::new(&mut restored);

        assert_eq!(slotted.get_record(0), Some(&b"persisted"[..]));
        assert_eq!(slotted.get_record(1), None);
    }
}
