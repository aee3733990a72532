//! # Collection Storage
//!
//! Per-collection document placement and the user-facing operations:
//! insert, find, update, delete, distinct, count, and index DDL.
//!
//! ## Placement
//!
//! Each collection owns a doubly-linked chain of data pages
//! (`firstPageId` through `lastPageId`). Inserts append to the last page;
//! a full page gets a fresh data page linked after it. Documents are
//! encoded through the codec and stored as slotted records.
//!
//! A document too large for one page is spilled into a chain of overflow
//! pages; the slotted record then holds a fixed 12-byte stub:
//!
//! ```text
//! +-------------+-------------+----------------+
//! | magic "OVER"| total (u32) | first page(u32)|
//! +-------------+-------------+----------------+
//! ```
//!
//! A stub can never be mistaken for a document: a document's leading u32
//! is its encoded length, and the magic decodes to a length far beyond the
//! 16 MiB document cap.
//!
//! ## Index coherence
//!
//! Every mutation mirrors into the collection's B+Trees. Inserts check
//! unique constraints before the document is written and roll the batch
//! back when a later entry insert still conflicts. Updates remove the
//! pre-image entries and insert post-image entries, undoing the document
//! write on conflict. A rollback that itself fails marks the handle
//! degraded; further mutations are refused until reopen.

use eyre::{ensure, Result, WrapErr};
use tracing::error;

use crate::btree::BTree;
use crate::catalog::{CollectionMeta, IndexMeta};
use crate::database::Database;
use crate::document::{
    compare_values, decode_document, encode_document, Document, ObjectId, Value,
};
use crate::error::{is_page_full, DbError};
use crate::index;
use crate::query::{apply_update, equality_fields, lookup_path, matches};
use crate::storage::{Page, PageType, Pager, SlottedPage, PAGE_DATA_SIZE, SLOT_SIZE};

pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_BATCH_SIZE: usize = 100_000;

const OVERFLOW_MAGIC: u32 = 0x4F56_4552;
const OVERFLOW_STUB_SIZE: usize = 12;

/// Largest record stored inline in a data page.
const MAX_INLINE_RECORD: usize = PAGE_DATA_SIZE - SLOT_SIZE;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// A handle to one collection. Borrows the database exclusively; the
/// engine is single-owner by design.
#[derive(Debug)]
pub struct Collection<'db> {
    db: &'db mut Database,
    slot: usize,
}

impl<'db> Collection<'db> {
    pub(crate) fn new(db: &'db mut Database, slot: usize) -> Self {
        Self { db, slot }
    }

    pub fn name(&self) -> &str {
        &self.db.catalog.collections[self.slot].name
    }

    pub fn count(&self) -> u64 {
        self.db.catalog.collections[self.slot].document_count
    }

    pub fn insert_one(&mut self, doc: Document) -> Result<Value> {
        let mut ids = self.insert_many(vec![doc])?;
        Ok(ids.remove(0))
    }

    pub fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<Value>> {
        let db = &mut *self.db;
        ensure!(!db.degraded, DbError::Degraded);
        ensure!(
            docs.len() <= MAX_BATCH_SIZE,
            DbError::InvalidArgument(format!(
                "batch of {} documents exceeds limit {}",
                docs.len(),
                MAX_BATCH_SIZE
            ))
        );

        let mut prepared: Vec<(Document, Vec<u8>, Value)> = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if !doc.contains_key("_id") {
                doc.insert_front("_id", Value::ObjectId(ObjectId::generate()));
            }
            let bytes = encode_document(&doc)?;
            ensure!(
                bytes.len() <= MAX_DOCUMENT_SIZE,
                DbError::InvalidArgument(format!(
                    "document of {} bytes exceeds limit {}",
                    bytes.len(),
                    MAX_DOCUMENT_SIZE
                ))
            );
            let id = doc
                .get("_id")
                .cloned()
                .ok_or_else(|| eyre::eyre!("_id vanished during prepare"))?;
            prepared.push((doc, bytes, id));
        }

        let mut written: Vec<(u32, u16, Document)> = Vec::new();
        for (doc, bytes, _) in &prepared {
            if let Err(err) = index::check_unique(
                &mut db.pager,
                &db.catalog.collections[self.slot].indexes,
                doc,
            ) {
                rollback_inserts(db, self.slot, &written);
                return Err(err);
            }

            let placed = append_record(
                &mut db.pager,
                &mut db.catalog.collections[self.slot],
                bytes,
            );
            let (page_id, slot) = match placed {
                Ok(location) => location,
                Err(err) => {
                    rollback_inserts(db, self.slot, &written);
                    return Err(err);
                }
            };

            let entry_result = index::insert_entries(
                &mut db.pager,
                &mut db.catalog.collections[self.slot].indexes,
                doc,
            );
            if let Err(err) = entry_result {
                if delete_record_at(&mut db.pager, page_id, slot).is_err() {
                    db.degraded = true;
                    error!(page_id, slot, "failed to undo record write, handle degraded");
                }
                rollback_inserts(db, self.slot, &written);
                return Err(err);
            }

            db.catalog.collections[self.slot].document_count += 1;
            written.push((page_id, slot, doc.clone()));
        }

        db.catalog.save(&mut db.pager)?;
        Ok(prepared.into_iter().map(|(_, _, id)| id).collect())
    }

    pub fn find(&mut self, filter: &Document) -> Result<Vec<Document>> {
        let db = &mut *self.db;
        let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;
        let mut results = Vec::new();
        for (_, _, doc) in entries {
            if matches(&doc, filter)? {
                results.push(doc);
            }
        }
        Ok(results)
    }

    pub fn find_one(&mut self, filter: &Document) -> Result<Option<Document>> {
        let db = &mut *self.db;
        let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;
        for (_, _, doc) in entries {
            if matches(&doc, filter)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Updates every matching document.
    pub fn update(
        &mut self,
        filter: &Document,
        spec: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.update_impl(filter, spec, true, upsert)
    }

    /// Updates the first matching document.
    pub fn update_one(
        &mut self,
        filter: &Document,
        spec: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.update_impl(filter, spec, false, upsert)
    }

    fn update_impl(
        &mut self,
        filter: &Document,
        spec: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let mut result = UpdateResult::default();
        {
            let db = &mut *self.db;
            ensure!(!db.degraded, DbError::Degraded);

            let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;
            for (page_id, slot, doc) in entries {
                if !matches(&doc, filter)? {
                    continue;
                }
                result.matched += 1;

                let mut updated = doc.clone();
                let changed = apply_update(&mut updated, spec)?;
                if changed {
                    let bytes = encode_document(&updated)?;
                    ensure!(
                        bytes.len() <= MAX_DOCUMENT_SIZE,
                        DbError::InvalidArgument(format!(
                            "updated document of {} bytes exceeds limit {}",
                            bytes.len(),
                            MAX_DOCUMENT_SIZE
                        ))
                    );
                    rewrite_record_at(&mut db.pager, page_id, slot, &bytes)?;

                    let meta = &mut db.catalog.collections[self.slot];
                    index::remove_entries(&mut db.pager, &mut meta.indexes, &doc)?;
                    if let Err(err) =
                        index::insert_entries(&mut db.pager, &mut meta.indexes, &updated)
                    {
                        let restored = encode_document(&doc)?;
                        let undo_doc =
                            rewrite_record_at(&mut db.pager, page_id, slot, &restored);
                        let undo_idx =
                            index::insert_entries(&mut db.pager, &mut meta.indexes, &doc);
                        if undo_doc.is_err() || undo_idx.is_err() {
                            db.degraded = true;
                            error!(page_id, slot, "update undo failed, handle degraded");
                        }
                        let _ = db.catalog.save(&mut db.pager);
                        return Err(err);
                    }
                    result.modified += 1;
                }
                if !multi {
                    break;
                }
            }

            if result.modified > 0 {
                db.catalog.save(&mut db.pager)?;
            }
        }

        if result.matched == 0 && upsert {
            let mut seed = equality_fields(filter);
            apply_update(&mut seed, spec)?;
            let mut ids = self.insert_many(vec![seed])?;
            result.upserted_id = Some(ids.remove(0));
        }
        Ok(result)
    }

    /// Deletes every matching document, returning how many went.
    pub fn delete_many(&mut self, filter: &Document) -> Result<u64> {
        self.delete_impl(filter, true)
    }

    /// Deletes the first matching document.
    pub fn delete_one(&mut self, filter: &Document) -> Result<u64> {
        self.delete_impl(filter, false)
    }

    fn delete_impl(&mut self, filter: &Document, multi: bool) -> Result<u64> {
        let db = &mut *self.db;
        ensure!(!db.degraded, DbError::Degraded);

        let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;
        let mut deleted = 0u64;
        for (page_id, slot, doc) in entries {
            if !matches(&doc, filter)? {
                continue;
            }
            let meta = &mut db.catalog.collections[self.slot];
            index::remove_entries(&mut db.pager, &mut meta.indexes, &doc)?;
            delete_record_at(&mut db.pager, page_id, slot)?;
            meta.document_count -= 1;
            deleted += 1;
            if !multi {
                break;
            }
        }

        if deleted > 0 {
            db.catalog.save(&mut db.pager)?;
        }
        Ok(deleted)
    }

    /// Distinct values of a dotted-path field across matching documents,
    /// in value order.
    pub fn distinct(&mut self, field: &str, filter: &Document) -> Result<Vec<Value>> {
        let db = &mut *self.db;
        let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;
        let mut values: Vec<Value> = Vec::new();
        for (_, _, doc) in entries {
            if !matches(&doc, filter)? {
                continue;
            }
            if let Some(value) = lookup_path(&doc, field) {
                values.push(value.clone());
            }
        }
        values.sort_by(compare_values);
        values.dedup_by(|a, b| compare_values(a, b) == std::cmp::Ordering::Equal);
        Ok(values)
    }

    /// Creates a B+Tree index over `keys` (a `{field: 1|-1}` document) and
    /// backfills it from existing documents. Returns the index name.
    pub fn create_index(&mut self, keys: &Document, unique: bool) -> Result<String> {
        let db = &mut *self.db;
        ensure!(!db.degraded, DbError::Degraded);
        ensure!(
            !keys.is_empty(),
            DbError::InvalidArgument("index spec must name at least one field".to_string())
        );

        let mut key_spec: Vec<(String, i32)> = Vec::with_capacity(keys.len());
        for (field, direction) in keys.iter() {
            ensure!(
                !field.is_empty(),
                DbError::InvalidArgument("index field name is empty".to_string())
            );
            let direction = direction.as_i64().unwrap_or(0);
            ensure!(
                direction == 1 || direction == -1,
                DbError::InvalidArgument(format!(
                    "index direction for '{}' must be 1 or -1",
                    field
                ))
            );
            key_spec.push((field.to_string(), direction as i32));
        }

        let name = index::default_index_name(&key_spec);
        ensure!(
            db.catalog.collections[self.slot]
                .indexes
                .iter()
                .all(|meta| meta.name != name),
            DbError::InvalidArgument(format!("index '{}' already exists", name))
        );

        let entries = scan_collection(&mut db.pager, &db.catalog.collections[self.slot])?;

        let tree = BTree::create(&mut db.pager, unique)?;
        let root_page_id = tree.root_page();
        drop(tree);
        let mut building = [IndexMeta {
            name: name.clone(),
            keys: key_spec,
            unique,
            root_page_id,
        }];

        for (_, _, doc) in &entries {
            if let Err(err) = index::insert_entries(&mut db.pager, &mut building, doc) {
                let [meta] = building;
                BTree::open(&mut db.pager, meta.root_page_id, meta.unique)?
                    .destroy()
                    .wrap_err("dismantling half-built index")?;
                return Err(err.wrap_err(format!("building index '{}'", name)));
            }
        }

        let [meta] = building;
        db.catalog.collections[self.slot].indexes.push(meta);
        db.catalog.save(&mut db.pager)?;
        Ok(name)
    }

    /// Drops an index by name, freeing its tree pages. Returns false when
    /// no such index exists.
    pub fn drop_index(&mut self, name: &str) -> Result<bool> {
        let db = &mut *self.db;
        ensure!(!db.degraded, DbError::Degraded);

        let position = db.catalog.collections[self.slot]
            .indexes
            .iter()
            .position(|meta| meta.name == name);
        let Some(position) = position else {
            return Ok(false);
        };

        let meta = db.catalog.collections[self.slot].indexes.remove(position);
        BTree::open(&mut db.pager, meta.root_page_id, meta.unique)?
            .destroy()
            .wrap_err_with(|| format!("dropping index '{}'", name))?;
        db.catalog.save(&mut db.pager)?;
        Ok(true)
    }

    pub fn list_indexes(&self) -> Vec<IndexMeta> {
        self.db.catalog.collections[self.slot].indexes.clone()
    }
}

/// Walks the data-page chain decoding every live record.
pub(crate) fn scan_collection(
    pager: &mut Pager,
    meta: &CollectionMeta,
) -> Result<Vec<(u32, u16, Document)>> {
    let mut out = Vec::new();
    let mut current = meta.first_page_id;
    let mut hops = 0u32;
    while current != 0 {
        hops += 1;
        ensure!(
            hops <= pager.page_count(),
            DbError::CorruptPage {
                page_id: current,
                reason: "data page chain cycle".to_string(),
            }
        );

        let mut page = pager.read_page(current)?;
        let next = page.next_page_id();
        let raws: Vec<(u16, Vec<u8>)> = {
            let slotted = SlottedPage::new(&mut page);
            (0..slotted.slot_count())
                .filter_map(|i| slotted.get_record(i).map(|r| (i, r.to_vec())))
                .collect()
        };
        for (slot, raw) in raws {
            let bytes = resolve_record(pager, &raw)?;
            let doc = decode_document(&bytes)
                .wrap_err_with(|| format!("decoding record {}:{}", current, slot))?;
            out.push((current, slot, doc));
        }
        current = next;
    }
    Ok(out)
}

/// Appends a record to the collection chain, spilling oversized documents
/// into overflow pages and growing the chain on `PageFull`.
fn append_record(
    pager: &mut Pager,
    meta: &mut CollectionMeta,
    bytes: &[u8],
) -> Result<(u32, u16)> {
    let stored = if bytes.len() > MAX_INLINE_RECORD {
        let first = write_overflow_chain(pager, bytes)?;
        make_stub(bytes.len(), first).to_vec()
    } else {
        bytes.to_vec()
    };

    let mut page = pager.read_page(meta.last_page_id)?;
    let inserted = {
        let mut slotted = SlottedPage::new(&mut page);
        slotted.insert_record(&stored)
    };
    match inserted {
        Ok(slot) => {
            pager.write_page(&page)?;
            Ok((page.id(), slot))
        }
        Err(err) if is_page_full(&err) => {
            let mut fresh = pager.allocate_page(PageType::Data)?;
            fresh.set_prev_page_id(page.id());
            let slot = {
                let mut slotted = SlottedPage::new(&mut fresh);
                slotted.insert_record(&stored)?
            };
            page.set_next_page_id(fresh.id());
            pager.write_page(&page)?;
            pager.write_page(&fresh)?;
            meta.last_page_id = fresh.id();
            Ok((fresh.id(), slot))
        }
        Err(err) => Err(err),
    }
}

/// Marks a record deleted, then releases any overflow chain it owned.
pub(crate) fn delete_record_at(pager: &mut Pager, page_id: u32, slot: u16) -> Result<()> {
    let mut page = pager.read_page(page_id)?;
    let raw = {
        let slotted = SlottedPage::new(&mut page);
        slotted.get_record(slot).map(<[u8]>::to_vec)
    };
    let Some(raw) = raw else {
        return Ok(());
    };

    {
        let mut slotted = SlottedPage::new(&mut page);
        slotted.delete_record(slot)?;
    }
    pager.write_page(&page)?;

    if let Some((_, first)) = parse_stub(&raw) {
        free_overflow_chain(pager, first)?;
    }
    Ok(())
}

/// Rewrites a record in place, migrating between inline and overflow
/// representations as the size dictates.
fn rewrite_record_at(pager: &mut Pager, page_id: u32, slot: u16, bytes: &[u8]) -> Result<()> {
    let mut page = pager.read_page(page_id)?;
    let raw = {
        let slotted = SlottedPage::new(&mut page);
        slotted
            .get_record(slot)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DbError::NotFound(format!("record {}:{}", page_id, slot)))?
    };
    let old_chain = parse_stub(&raw).map(|(_, first)| first);

    let (stored, new_chain) = if bytes.len() > MAX_INLINE_RECORD {
        let first = write_overflow_chain(pager, bytes)?;
        (make_stub(bytes.len(), first).to_vec(), Some(first))
    } else {
        (bytes.to_vec(), None)
    };

    let updated = {
        let mut slotted = SlottedPage::new(&mut page);
        slotted.update_record(slot, &stored)
    };
    if let Err(err) = updated {
        if let Some(first) = new_chain {
            free_overflow_chain(pager, first)?;
        }
        return Err(err);
    }
    pager.write_page(&page)?;

    if let Some(first) = old_chain {
        free_overflow_chain(pager, first)?;
    }
    Ok(())
}

fn resolve_record(pager: &mut Pager, raw: &[u8]) -> Result<Vec<u8>> {
    match parse_stub(raw) {
        Some((total, first)) => read_overflow_chain(pager, first, total),
        None => Ok(raw.to_vec()),
    }
}

fn make_stub(total: usize, first_page: u32) -> [u8; OVERFLOW_STUB_SIZE] {
    let mut stub = [0u8; OVERFLOW_STUB_SIZE];
    stub[0..4].copy_from_slice(&OVERFLOW_MAGIC.to_le_bytes());
    stub[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    stub[8..12].copy_from_slice(&first_page.to_le_bytes());
    stub
}

fn parse_stub(raw: &[u8]) -> Option<(usize, u32)> {
    if raw.len() != OVERFLOW_STUB_SIZE {
        return None;
    }
    if u32::from_le_bytes(raw[0..4].try_into().ok()?) != OVERFLOW_MAGIC {
        return None;
    }
    let total = u32::from_le_bytes(raw[4..8].try_into().ok()?) as usize;
    let first = u32::from_le_bytes(raw[8..12].try_into().ok()?);
    Some((total, first))
}

fn write_overflow_chain(pager: &mut Pager, bytes: &[u8]) -> Result<u32> {
    let chunks: Vec<&[u8]> = bytes.chunks(PAGE_DATA_SIZE).collect();
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        ids.push(pager.allocate_page(PageType::Overflow)?.id());
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = Page::new(ids[i], PageType::Overflow);
        page.data_mut()[..chunk.len()].copy_from_slice(chunk);
        if i + 1 < ids.len() {
            page.set_next_page_id(ids[i + 1]);
        }
        if i > 0 {
            page.set_prev_page_id(ids[i - 1]);
        }
        pager.write_page(&page)?;
    }
    Ok(ids[0])
}

fn read_overflow_chain(pager: &mut Pager, first: u32, total: usize) -> Result<Vec<u8>> {
    ensure!(
        total <= MAX_DOCUMENT_SIZE,
        DbError::CorruptPage {
            page_id: first,
            reason: format!("overflow stub declares {} bytes", total),
        }
    );
    let mut buf = Vec::with_capacity(total);
    let mut current = first;
    while buf.len() < total {
        ensure!(
            current != 0,
            DbError::CorruptPage {
                page_id: first,
                reason: format!("overflow chain ends at {} of {} bytes", buf.len(), total),
            }
        );
        let page = pager.read_page(current)?;
        ensure!(
            page.page_type() == PageType::Overflow,
            DbError::CorruptPage {
                page_id: current,
                reason: format!("expected overflow page, found {:?}", page.page_type()),
            }
        );
        let chunk = (total - buf.len()).min(PAGE_DATA_SIZE);
        buf.extend_from_slice(&page.data()[..chunk]);
        current = page.next_page_id();
    }
    Ok(buf)
}

fn free_overflow_chain(pager: &mut Pager, first: u32) -> Result<()> {
    let mut ids = Vec::new();
    let mut current = first;
    while current != 0 {
        let page = pager.read_page(current)?;
        if page.page_type() != PageType::Overflow {
            break;
        }
        ids.push(current);
        current = page.next_page_id();
    }
    for id in ids {
        pager.free_page(id)?;
    }
    Ok(())
}

/// Frees every page a collection's documents occupy: overflow chains
/// first, then the data-page chain itself. Index trees are the caller's
/// concern.
pub(crate) fn free_collection_storage(pager: &mut Pager, meta: &CollectionMeta) -> Result<()> {
    let mut data_pages = Vec::new();
    let mut overflow_heads = Vec::new();

    let mut current = meta.first_page_id;
    let mut hops = 0u32;
    while current != 0 {
        hops += 1;
        ensure!(
            hops <= pager.page_count(),
            DbError::CorruptPage {
                page_id: current,
                reason: "data page chain cycle".to_string(),
            }
        );
        let mut page = pager.read_page(current)?;
        data_pages.push(current);
        {
            let slotted = SlottedPage::new(&mut page);
            for i in 0..slotted.slot_count() {
                if let Some(raw) = slotted.get_record(i) {
                    if let Some((_, first)) = parse_stub(raw) {
                        overflow_heads.push(first);
                    }
                }
            }
        }
        current = page.next_page_id();
    }

    for head in overflow_heads {
        free_overflow_chain(pager, head)?;
    }
    for page_id in data_pages {
        pager.free_page(page_id)?;
    }
    Ok(())
}

/// Best-effort reversal of a partially applied insert batch, newest first.
/// Failures here leave the handle degraded.
fn rollback_inserts(db: &mut Database, collection: usize, written: &[(u32, u16, Document)]) {
    for (page_id, slot, doc) in written.iter().rev() {
        let meta = &mut db.catalog.collections[collection];
        let entries_removed = index::remove_entries(&mut db.pager, &mut meta.indexes, doc);
        let record_removed = delete_record_at(&mut db.pager, *page_id, *slot);
        match (entries_removed, record_removed) {
            (Ok(()), Ok(())) => {
                db.catalog.collections[collection].document_count -= 1;
            }
            (entries, record) => {
                db.degraded = true;
                error!(
                    page_id,
                    slot,
                    index_undo_failed = entries.is_err(),
                    record_undo_failed = record.is_err(),
                    "insert rollback failed, handle degraded"
                );
            }
        }
    }
    if let Err(err) = db.catalog.save(&mut db.pager) {
        db.degraded = true;
        error!(error = %err, "catalog save after rollback failed, handle degraded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::Database;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(&dir.path().join("db")).unwrap()
    }

    #[test]
    fn insert_generates_leading_object_id() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        let id = users.insert_one(doc! { "name" => "Alice" }).unwrap();

        assert!(matches!(id, Value::ObjectId(_)));
        let found = users.find_one(&doc! { "name" => "Alice" }).unwrap().unwrap();
        assert_eq!(found.keys().next(), Some("_id"));
        assert_eq!(found.get("_id"), Some(&id));
    }

    #[test]
    fn provided_id_is_kept() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        let id = users.insert_one(doc! { "_id" => 42, "x" => 1 }).unwrap();
        assert_eq!(id, Value::Int32(42));
    }

    #[test]
    fn count_tracks_inserts_and_deletes() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        let docs: Vec<Document> = (0..10).map(|i| doc! { "_id" => i, "n" => i }).collect();
        users.insert_many(docs).unwrap();
        assert_eq!(users.count(), 10);

        let deleted = users
            .delete_many(&doc! { "n" => doc! { "$lt" => 5 } })
            .unwrap();
        assert_eq!(deleted, 5);
        assert_eq!(users.count(), 5);
    }

    #[test]
    fn inserts_spill_onto_new_pages() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut items = db.collection("items").unwrap();

        // Each document encodes to roughly 1 KiB; a few hundred need
        // several data pages.
        let docs: Vec<Document> = (0..300)
            .map(|i| doc! { "_id" => i, "pad" => "x".repeat(1000) })
            .collect();
        items.insert_many(docs).unwrap();

        assert_eq!(items.count(), 300);
        assert_eq!(items.find(&Document::new()).unwrap().len(), 300);

        let meta = &items.db.catalog.collections[items.slot];
        assert_ne!(meta.first_page_id, meta.last_page_id);
    }

    #[test]
    fn oversized_documents_round_trip_through_overflow_pages() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut blobs = db.collection("blobs").unwrap();

        let big = "y".repeat(20_000);
        blobs
            .insert_one(doc! { "_id" => 1, "payload" => big.clone() })
            .unwrap();

        let found = blobs.find_one(&doc! { "_id" => 1 }).unwrap().unwrap();
        assert_eq!(found.get("payload"), Some(&Value::String(big)));
    }

    #[test]
    fn deleting_overflow_documents_frees_their_chain() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut blobs = db.collection("blobs").unwrap();

        blobs
            .insert_one(doc! { "_id" => 1, "payload" => "z".repeat(20_000) })
            .unwrap();
        let free_before = blobs.db.pager.free_list_len();

        blobs.delete_one(&doc! { "_id" => 1 }).unwrap();

        assert!(blobs.db.pager.free_list_len() > free_before);
        assert_eq!(blobs.count(), 0);
    }

    #[test]
    fn document_over_the_size_cap_is_rejected() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut blobs = db.collection("blobs").unwrap();

        let err = blobs
            .insert_one(doc! { "_id" => 1, "p" => "a".repeat(MAX_DOCUMENT_SIZE + 1) })
            .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(DbError::InvalidArgument(_))
        ));
        assert_eq!(blobs.count(), 0);
    }

    #[test]
    fn update_set_modifies_matching_documents() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.insert_one(doc! { "x" => 5, "y" => 10 }).unwrap();
        let result = users
            .update(
                &doc! { "x" => 5 },
                &doc! { "$set" => doc! { "y" => 20 } },
                false,
            )
            .unwrap();

        assert_eq!(result.matched, 1);
        assert_eq!(result.modified, 1);
        let found = users.find_one(&doc! { "x" => 5 }).unwrap().unwrap();
        assert_eq!(found.get("y"), Some(&Value::Int32(20)));
    }

    #[test]
    fn update_counts_matched_but_unmodified() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.insert_one(doc! { "x" => 5 }).unwrap();
        let result = users
            .update(&doc! { "x" => 5 }, &doc! { "$set" => doc! { "x" => 5 } }, false)
            .unwrap();

        assert_eq!(result.matched, 1);
        assert_eq!(result.modified, 0);
    }

    #[test]
    fn upsert_inserts_from_filter_and_spec() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        let result = users
            .update(
                &doc! { "name" => "Ghost" },
                &doc! { "$set" => doc! { "seen" => 1 } },
                true,
            )
            .unwrap();

        assert_eq!(result.matched, 0);
        assert!(result.upserted_id.is_some());
        let found = users.find_one(&doc! { "name" => "Ghost" }).unwrap().unwrap();
        assert_eq!(found.get("seen"), Some(&Value::Int32(1)));
    }

    #[test]
    fn growing_update_within_page_capacity_succeeds() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.insert_one(doc! { "_id" => 1, "s" => "short" }).unwrap();
        users
            .update(
                &doc! { "_id" => 1 },
                &doc! { "$set" => doc! { "s" => "a considerably longer value" } },
                false,
            )
            .unwrap();

        let found = users.find_one(&doc! { "_id" => 1 }).unwrap().unwrap();
        assert_eq!(
            found.get("s"),
            Some(&Value::String("a considerably longer value".into()))
        );
    }

    #[test]
    fn growing_update_past_page_capacity_fails_fast() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        // Fill one page nearly to the brim with two documents.
        users
            .insert_many(vec![
                doc! { "_id" => 1, "pad" => "a".repeat(1900) },
                doc! { "_id" => 2, "pad" => "b".repeat(1900) },
            ])
            .unwrap();

        let err = users
            .update(
                &doc! { "_id" => 1 },
                &doc! { "$set" => doc! { "pad" => "c".repeat(2400) } },
                false,
            )
            .unwrap_err();
        assert!(is_page_full(&err));

        // The original document is intact.
        let found = users.find_one(&doc! { "_id" => 1 }).unwrap().unwrap();
        assert_eq!(found.get("pad"), Some(&Value::String("a".repeat(1900))));
    }

    #[test]
    fn distinct_returns_sorted_unique_values() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users
            .insert_many(vec![
                doc! { "city" => "Oslo" },
                doc! { "city" => "Bergen" },
                doc! { "city" => "Oslo" },
                doc! { "other" => 1 },
            ])
            .unwrap();

        let cities = users.distinct("city", &Document::new()).unwrap();
        assert_eq!(
            cities,
            vec![
                Value::String("Bergen".into()),
                Value::String("Oslo".into())
            ]
        );
    }

    #[test]
    fn unique_index_rejects_second_insert_and_keeps_count() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.create_index(&doc! { "email" => 1 }, true).unwrap();
        users
            .insert_one(doc! { "_id" => 1, "email" => "a@x" })
            .unwrap();

        let err = users
            .insert_one(doc! { "_id" => 2, "email" => "a@x" })
            .unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));

        assert_eq!(users.count(), 1);
        let kept = users.find_one(&doc! { "email" => "a@x" }).unwrap().unwrap();
        assert_eq!(kept.get("_id"), Some(&Value::Int32(1)));
    }

    #[test]
    fn failed_batch_rolls_back_earlier_documents() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.create_index(&doc! { "k" => 1 }, true).unwrap();
        users.insert_one(doc! { "_id" => 0, "k" => "taken" }).unwrap();

        let err = users
            .insert_many(vec![
                doc! { "_id" => 1, "k" => "fresh-1" },
                doc! { "_id" => 2, "k" => "fresh-2" },
                doc! { "_id" => 3, "k" => "taken" },
            ])
            .unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));

        assert_eq!(users.count(), 1);
        assert!(users.find_one(&doc! { "_id" => 1 }).unwrap().is_none());
        assert!(users.find_one(&doc! { "_id" => 2 }).unwrap().is_none());
        // The slots are reusable afterwards.
        users.insert_one(doc! { "_id" => 9, "k" => "fresh-1" }).unwrap();
    }

    #[test]
    fn update_into_unique_conflict_is_undone() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.create_index(&doc! { "k" => 1 }, true).unwrap();
        users.insert_one(doc! { "_id" => 1, "k" => "one" }).unwrap();
        users.insert_one(doc! { "_id" => 2, "k" => "two" }).unwrap();

        let err = users
            .update(
                &doc! { "_id" => 2 },
                &doc! { "$set" => doc! { "k" => "one" } },
                false,
            )
            .unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));

        let kept = users.find_one(&doc! { "_id" => 2 }).unwrap().unwrap();
        assert_eq!(kept.get("k"), Some(&Value::String("two".into())));
    }

    #[test]
    fn create_index_backfills_existing_documents() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.insert_one(doc! { "_id" => 1, "k" => "dup" }).unwrap();
        users.insert_one(doc! { "_id" => 2, "k" => "dup" }).unwrap();

        // Unique build over colliding data fails and leaves no index.
        let err = users.create_index(&doc! { "k" => 1 }, true).unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));
        assert!(users.list_indexes().is_empty());

        // A non-unique build succeeds.
        let name = users.create_index(&doc! { "k" => 1 }, false).unwrap();
        assert_eq!(name, "k_1");
        assert_eq!(users.list_indexes().len(), 1);
    }

    #[test]
    fn drop_index_is_idempotent_and_frees_pages() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        let docs: Vec<Document> = (0..200).map(|i| doc! { "_id" => i, "n" => i }).collect();
        users.insert_many(docs).unwrap();
        users.create_index(&doc! { "n" => 1 }, false).unwrap();
        let free_before = users.db.pager.free_list_len();

        assert!(users.drop_index("n_1").unwrap());
        assert!(!users.drop_index("n_1").unwrap());
        assert!(users.db.pager.free_list_len() > free_before);
    }

    #[test]
    fn deletes_keep_indexes_coherent() {
        let dir = tempdir().unwrap();
        let mut db = open_db(&dir);
        let mut users = db.collection("users").unwrap();

        users.create_index(&doc! { "k" => 1 }, true).unwrap();
        users.insert_one(doc! { "_id" => 1, "k" => "free-me" }).unwrap();
        users.delete_one(&doc! { "_id" => 1 }).unwrap();

        // The key is reusable after the delete.
        users.insert_one(doc! { "_id" => 2, "k" => "free-me" }).unwrap();
        assert_eq!(users.count(), 1);
    }
}
