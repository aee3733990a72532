//! # Pager
//!
//! Owns the database file. Everything above this layer addresses pages by
//! id; the pager turns that into positioned file I/O with WAL-first
//! durability, a bounded read cache, and free-list reuse.
//!
//! ## Mutation Protocol
//!
//! Within one mutating operation the order is fixed:
//!
//! 1. WAL record(s) describing the mutation
//! 2. WAL fsync for structural mutations (allocate, free)
//! 3. the data-file write
//!
//! `flush` is the durability barrier: it syncs the WAL, writes every dirty
//! page (logging each image first), fsyncs the data file, rewrites the file
//! header with a fresh modification time, and checkpoints the WAL.
//!
//! ## Recovery
//!
//! When `open` finds a WAL left behind by a previous process, records with
//! LSN past the checkpoint are replayed in log order:
//!
//! - page-write: the 4096-byte image overwrites the page region
//! - alloc-page: raises `page_count` if needed and initializes the region
//!   with an empty page of the recorded type
//! - meta-update: applies the new value to the in-memory file header
//! - free-page / commit / checkpoint: no direct effect
//!
//! Afterwards the file is extended to `64 + page_count * 4096` (missing
//! trailing pages get empty images of their recorded alloc type, data
//! otherwise), the header is rewritten, and the free-list is reloaded by
//! walking the chain from the header. Replay is idempotent; a crash during
//! recovery is healed by the next recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use super::cache::{PageCache, DEFAULT_CACHE_CAPACITY};
use super::wal::{MetaField, RecordType, Wal};
use super::{
    now_millis, page_offset, FileHeader, Page, PageType, FILE_HEADER_SIZE, PAGE_SIZE,
};
use crate::error::DbError;

#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub cache_capacity: usize,
    pub wal_auto_truncate: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            wal_auto_truncate: true,
        }
    }
}

#[derive(Debug)]
pub struct Pager {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
    header: FileHeader,
    wal: Wal,
    cache: PageCache,
    dirty: HashSet<u32>,
    free_list: Vec<u32>,
    page_lsns: HashMap<u32, u64>,
}

/// Sidecar log path: `<db>.wal` next to the data file.
pub fn wal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

impl Pager {
    pub fn open(path: &Path, options: PagerOptions) -> Result<Self> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file at {:?}", path))?;

        let wal = Wal::open(&wal_path_for(path), options.wal_auto_truncate)?;

        let mut pager = if fresh {
            let mut header = FileHeader::new(now_millis());
            header.set_page_count(1);
            header.set_meta_page_id(0);

            file.seek(SeekFrom::Start(0))?;
            file.write_all(header.as_bytes())
                .wrap_err("failed to write initial file header")?;
            let meta = Page::new(0, PageType::Meta);
            file.write_all(&meta.marshal())
                .wrap_err("failed to write initial meta page")?;
            file.sync_all()
                .wrap_err("failed to sync freshly created database file")?;
            info!(?path, "created database file");

            Self {
                file,
                path: path.to_path_buf(),
                header,
                wal,
                cache: PageCache::new(options.cache_capacity),
                dirty: HashSet::new(),
                free_list: Vec::new(),
                page_lsns: HashMap::new(),
            }
        } else {
            let mut header_bytes = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header_bytes)
                .wrap_err("failed to read file header")?;
            let header = *FileHeader::from_bytes(&header_bytes)?;

            Self {
                file,
                path: path.to_path_buf(),
                header,
                wal,
                cache: PageCache::new(options.cache_capacity),
                dirty: HashSet::new(),
                free_list: Vec::new(),
                page_lsns: HashMap::new(),
            }
        };

        if pager.wal.pre_existing() {
            pager.recover()?;
        }
        pager.load_free_list()?;
        Ok(pager)
    }

    pub fn page_count(&self) -> u32 {
        self.header.page_count()
    }

    pub fn catalog_page_id(&self) -> u32 {
        self.header.catalog_page_id()
    }

    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirty.len()
    }

    /// Reads a page, serving from cache when resident. Checksums are
    /// verified on the file path.
    pub fn read_page(&mut self, page_id: u32) -> Result<Page> {
        ensure!(
            page_id < self.header.page_count(),
            DbError::NotFound(format!(
                "page {} beyond page count {}",
                page_id,
                self.header.page_count()
            ))
        );

        if let Some(page) = self.cache.get(page_id) {
            return Ok(page.clone());
        }

        let page = self.read_page_from_file(page_id)?;
        self.cache.admit(page.clone(), &self.dirty);
        Ok(page)
    }

    fn read_page_from_file(&mut self, page_id: u32) -> Result<Page> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(page_offset(page_id)))?;
        self.file
            .read_exact(&mut buf)
            .wrap_err_with(|| format!("failed to read page {}", page_id))?;
        Page::unmarshal(&buf).wrap_err_with(|| format!("while reading page {}", page_id))
    }

    /// Logs a page image and writes it to the data file.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let image = page.marshal();
        let lsn = self.wal.write_page_record(page.id(), &image)?;

        self.file.seek(SeekFrom::Start(page_offset(page.id())))?;
        self.file
            .write_all(&image)
            .wrap_err_with(|| format!("failed to write page {}", page.id()))?;

        self.page_lsns.insert(page.id(), lsn);
        self.dirty.remove(&page.id());
        self.cache.admit(page.clone(), &self.dirty);
        Ok(())
    }

    /// Keeps a mutated page in cache for a later `flush`. The WAL record is
    /// written when the page is.
    pub fn mark_dirty(&mut self, page: &Page) {
        self.dirty.insert(page.id());
        self.cache.admit(page.clone(), &self.dirty);
    }

    /// Allocates a page, preferring the free-list head over extending the
    /// file. The WAL records land and sync before any state changes.
    pub fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        if let Some(&head) = self.free_list.first() {
            let next = self.read_page(head)?.next_page_id();

            self.wal.write_alloc_record(head, page_type as u8)?;
            self.wal
                .write_meta_record(MetaField::FreeListHead, head, next)?;
            self.wal.sync()?;

            self.free_list.remove(0);
            self.header.set_free_list_head(next);

            let page = Page::new(head, page_type);
            self.mark_dirty(&page);
            debug!(page_id = head, ?page_type, "allocated page from free list");
            return Ok(page);
        }

        let new_id = self.header.page_count();
        self.wal.write_alloc_record(new_id, page_type as u8)?;
        self.wal
            .write_meta_record(MetaField::PageCount, new_id, new_id + 1)?;
        self.wal.sync()?;

        let page = Page::new(new_id, page_type);
        self.file.seek(SeekFrom::Start(page_offset(new_id)))?;
        self.file
            .write_all(&page.marshal())
            .wrap_err_with(|| format!("failed to extend file with page {}", new_id))?;

        self.header.set_page_count(new_id + 1);
        self.mark_dirty(&page);
        debug!(page_id = new_id, ?page_type, "allocated page by extending file");
        Ok(page)
    }

    /// Returns a page to the free-list by prepending it.
    pub fn free_page(&mut self, page_id: u32) -> Result<()> {
        ensure!(
            page_id < self.header.page_count(),
            DbError::NotFound(format!("cannot free page {} beyond file", page_id))
        );
        ensure!(
            page_id != self.header.meta_page_id(),
            DbError::InvalidArgument("cannot free the meta page".to_string())
        );

        let old_head = self.header.free_list_head();
        self.wal.write_free_record(page_id)?;
        self.wal
            .write_meta_record(MetaField::FreeListHead, old_head, page_id)?;
        self.wal.sync()?;

        let mut page = Page::new(page_id, PageType::Free);
        page.set_next_page_id(old_head);
        self.write_page(&page)?;

        self.header.set_free_list_head(page_id);
        self.free_list.insert(0, page_id);
        self.dirty.remove(&page_id);
        Ok(())
    }

    /// Records a catalog relocation in the WAL and the in-memory header.
    pub fn set_catalog_page_id(&mut self, page_id: u32) -> Result<()> {
        let old = self.header.catalog_page_id();
        if old == page_id {
            return Ok(());
        }
        self.wal
            .write_meta_record(MetaField::CatalogPageId, old, page_id)?;
        self.wal.sync()?;
        self.header.set_catalog_page_id(page_id);
        Ok(())
    }

    /// Durability barrier: after this returns, every prior mutation is in
    /// the data file and covered by a checkpoint.
    pub fn flush(&mut self) -> Result<()> {
        self.wal.sync()?;

        let mut ids: Vec<u32> = self.dirty.iter().copied().collect();
        ids.sort_unstable();

        let mut images: Vec<(u32, Vec<u8>)> = Vec::with_capacity(ids.len());
        for id in &ids {
            let page = self
                .cache
                .get(*id)
                .ok_or_else(|| eyre::eyre!("dirty page {} missing from cache", id))?;
            let image = page.marshal();
            let lsn = self.wal.write_page_record(*id, &image)?;
            self.page_lsns.insert(*id, lsn);
            images.push((*id, image));
        }
        self.wal.sync()?;

        for (id, image) in &images {
            self.file.seek(SeekFrom::Start(page_offset(*id)))?;
            self.file
                .write_all(image)
                .wrap_err_with(|| format!("failed to flush page {}", id))?;
        }
        self.file
            .sync_all()
            .wrap_err("failed to fsync data file during flush")?;

        self.header.set_modified_at(now_millis());
        self.write_header()?;
        self.file
            .sync_all()
            .wrap_err("failed to fsync header during flush")?;

        self.dirty.clear();
        let covered = self.wal.current_lsn() - 1;
        self.wal.checkpoint(covered)?;
        debug!(covered_lsn = covered, pages = images.len(), "flush complete");
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.wal.close()
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(self.header.as_bytes())
            .wrap_err("failed to rewrite file header")
    }

    fn load_free_list(&mut self) -> Result<()> {
        self.free_list.clear();
        let mut current = self.header.free_list_head();
        let mut seen = HashSet::new();
        while current != 0 {
            ensure!(
                seen.insert(current),
                DbError::CorruptPage {
                    page_id: current,
                    reason: "free-list cycle".to_string(),
                }
            );
            ensure!(
                current < self.header.page_count(),
                DbError::CorruptPage {
                    page_id: current,
                    reason: "free-list points beyond file".to_string(),
                }
            );
            self.free_list.push(current);
            current = self.read_page_from_file(current)?.next_page_id();
        }
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let start = self.wal.checkpoint_lsn() + 1;
        let records = self.wal.read_records_from(start)?;
        if records.is_empty() {
            return Ok(());
        }
        info!(
            records = records.len(),
            from_lsn = start,
            "replaying WAL records"
        );

        let mut alloc_types: HashMap<u32, PageType> = HashMap::new();
        for record in &records {
            match record.record_type {
                RecordType::PageWrite => {
                    ensure!(
                        record.payload.len() == PAGE_SIZE,
                        DbError::CorruptWal(format!(
                            "page-write record for page {} has {} payload bytes",
                            record.page_id,
                            record.payload.len()
                        ))
                    );
                    self.file
                        .seek(SeekFrom::Start(page_offset(record.page_id)))?;
                    self.file
                        .write_all(&record.payload)
                        .wrap_err_with(|| format!("redo of page {}", record.page_id))?;
                    if record.page_id >= self.header.page_count() {
                        self.header.set_page_count(record.page_id + 1);
                    }
                }
                RecordType::AllocPage => {
                    let page_type = record
                        .payload
                        .first()
                        .and_then(|b| PageType::from_byte(*b))
                        .unwrap_or(PageType::Data);
                    alloc_types.insert(record.page_id, page_type);
                    if record.page_id >= self.header.page_count() {
                        self.header.set_page_count(record.page_id + 1);
                    }
                    let page = Page::new(record.page_id, page_type);
                    self.file
                        .seek(SeekFrom::Start(page_offset(record.page_id)))?;
                    self.file
                        .write_all(&page.marshal())
                        .wrap_err_with(|| format!("redo alloc of page {}", record.page_id))?;
                }
                RecordType::MetaUpdate => {
                    ensure!(
                        record.payload.len() == 9,
                        DbError::CorruptWal("meta-update payload must be 9 bytes".to_string())
                    );
                    let new =
                        u32::from_le_bytes(record.payload[5..9].try_into().unwrap());
                    match MetaField::from_byte(record.payload[0]) {
                        Some(MetaField::FreeListHead) => self.header.set_free_list_head(new),
                        Some(MetaField::PageCount) => self.header.set_page_count(new),
                        Some(MetaField::CatalogPageId) => self.header.set_catalog_page_id(new),
                        None => {}
                    }
                }
                RecordType::FreePage | RecordType::Commit | RecordType::Checkpoint => {}
            }
        }

        // Bring the file up to the header's invariant size, initializing
        // any trailing pages replay never touched.
        let target = page_offset(self.header.page_count());
        let actual = self.file.metadata()?.len();
        if actual < target {
            let first_missing =
                ((actual.saturating_sub(FILE_HEADER_SIZE as u64)) / PAGE_SIZE as u64) as u32;
            for page_id in first_missing..self.header.page_count() {
                let page_type = alloc_types
                    .get(&page_id)
                    .copied()
                    .unwrap_or(PageType::Data);
                let page = Page::new(page_id, page_type);
                self.file.seek(SeekFrom::Start(page_offset(page_id)))?;
                self.file
                    .write_all(&page.marshal())
                    .wrap_err_with(|| format!("initializing missing page {}", page_id))?;
            }
        }

        self.write_header()?;
        self.file
            .sync_all()
            .wrap_err("failed to fsync data file after recovery")?;
        info!(page_count = self.header.page_count(), "recovery complete");
        Ok(())
    }
}
