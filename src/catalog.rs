//! # Collection Catalog
//!
//! The persisted directory of collections and their indexes, stored as one
//! serialized document:
//!
//! ```text
//! { collections: [ { name, firstPageId, lastPageId, documentCount,
//!                    indexPageId, indexes: [ { name, keys, unique,
//!                    rootPageId } ] } ] }
//! ```
//!
//! The file header points at the catalog's first page (0 = no collections
//! yet). A catalog that fits one page is stored raw in the page's data
//! area, sized by the document encoding's own length prefix. A larger
//! catalog uses a page chain:
//!
//! ```text
//! First page data area          Continuation pages
//! +-------------------------+  +------------------------+
//! | magic 0x4D504354 (u32)  |  | raw payload...         |
//! | total_len (u32)         |  +------------------------+
//! | page_count (u32)        |     linked by next_page_id
//! | payload...              |
//! +-------------------------+
//! ```
//!
//! `save` reuses the existing chain where it can, allocating extra pages or
//! freeing surplus ones as the catalog grows and shrinks. Index B+Trees are
//! not loaded here; they open lazily from their recorded root page ids.

use eyre::{ensure, Result, WrapErr};

use crate::document::{decode_document, encode_document, encoded_len, Document, Value};
use crate::storage::{Page, PageType, Pager, PAGE_DATA_SIZE};

pub const CATALOG_CHAIN_MAGIC: u32 = 0x4D50_4354;

/// Chain header: magic + total length + page count.
const CHAIN_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub name: String,
    /// (field path, direction) pairs; direction is 1 or -1.
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
    pub root_page_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub name: String,
    pub first_page_id: u32,
    pub last_page_id: u32,
    pub document_count: u64,
    /// Reserved directory page; always 0 in this version.
    pub index_page_id: u32,
    pub indexes: Vec<IndexMeta>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub collections: Vec<CollectionMeta>,
}

impl Catalog {
    pub fn collection(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut CollectionMeta> {
        self.collections.iter_mut().find(|c| c.name == name)
    }

    /// Reads the catalog from the page the file header points at.
    pub fn load(pager: &mut Pager) -> Result<Self> {
        let head = pager.catalog_page_id();
        if head == 0 {
            return Ok(Self::default());
        }

        let page = pager.read_page(head).wrap_err("reading catalog page")?;
        let data = page.data();
        let lead = u32::from_le_bytes(data[..4].try_into().unwrap());

        let bytes = if lead == CATALOG_CHAIN_MAGIC {
            let total_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            let mut buf = Vec::with_capacity(total_len);
            let first_chunk = total_len.min(PAGE_DATA_SIZE - CHAIN_HEADER_SIZE);
            buf.extend_from_slice(&data[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + first_chunk]);

            let mut current = page.next_page_id();
            while buf.len() < total_len {
                ensure!(
                    current != 0,
                    "catalog chain ends early: {} of {} bytes",
                    buf.len(),
                    total_len
                );
                let cont = pager.read_page(current)?;
                let chunk = (total_len - buf.len()).min(PAGE_DATA_SIZE);
                buf.extend_from_slice(&cont.data()[..chunk]);
                current = cont.next_page_id();
            }
            buf
        } else {
            let len = encoded_len(data)?;
            ensure!(
                len <= PAGE_DATA_SIZE,
                "single-page catalog declares {} bytes",
                len
            );
            data[..len].to_vec()
        };

        let doc = decode_document(&bytes).wrap_err("decoding catalog document")?;
        Self::from_document(&doc)
    }

    /// Persists the catalog, reusing or resizing the existing page chain,
    /// and updates the file header pointer.
    pub fn save(&self, pager: &mut Pager) -> Result<()> {
        let bytes = encode_document(&self.to_document())?;

        let mut pages: Vec<u32> = Vec::new();
        let mut current = pager.catalog_page_id();
        while current != 0 {
            let page = pager.read_page(current)?;
            pages.push(current);
            current = page.next_page_id();
        }

        let needed = if bytes.len() <= PAGE_DATA_SIZE {
            1
        } else {
            let rest = bytes.len() - (PAGE_DATA_SIZE - CHAIN_HEADER_SIZE);
            1 + rest.div_ceil(PAGE_DATA_SIZE)
        };

        while pages.len() < needed {
            pages.push(pager.allocate_page(PageType::Catalog)?.id());
        }
        while pages.len() > needed {
            if let Some(surplus) = pages.pop() {
                pager.free_page(surplus)?;
            }
        }

        if needed == 1 {
            let mut page = Page::new(pages[0], PageType::Catalog);
            page.data_mut()[..bytes.len()].copy_from_slice(&bytes);
            pager.write_page(&page)?;
        } else {
            let mut cursor = 0usize;
            for (i, &page_id) in pages.iter().enumerate() {
                let mut page = Page::new(page_id, PageType::Catalog);
                if i + 1 < pages.len() {
                    page.set_next_page_id(pages[i + 1]);
                }
                if i > 0 {
                    page.set_prev_page_id(pages[i - 1]);
                }

                let data = page.data_mut();
                let chunk = if i == 0 {
                    data[0..4].copy_from_slice(&CATALOG_CHAIN_MAGIC.to_le_bytes());
                    data[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                    data[8..12].copy_from_slice(&(needed as u32).to_le_bytes());
                    let chunk = (bytes.len() - cursor).min(PAGE_DATA_SIZE - CHAIN_HEADER_SIZE);
                    data[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + chunk]
                        .copy_from_slice(&bytes[cursor..cursor + chunk]);
                    chunk
                } else {
                    let chunk = (bytes.len() - cursor).min(PAGE_DATA_SIZE);
                    data[..chunk].copy_from_slice(&bytes[cursor..cursor + chunk]);
                    chunk
                };
                cursor += chunk;
                pager.write_page(&page)?;
            }
        }

        pager.set_catalog_page_id(pages[0])
    }

    fn to_document(&self) -> Document {
        let mut root = Document::new();
        let collections: Vec<Value> = self
            .collections
            .iter()
            .map(|meta| {
                let mut doc = Document::new();
                doc.insert("name", meta.name.clone());
                doc.insert("firstPageId", meta.first_page_id as i64);
                doc.insert("lastPageId", meta.last_page_id as i64);
                doc.insert("documentCount", meta.document_count as i64);
                doc.insert("indexPageId", meta.index_page_id as i64);
                let indexes: Vec<Value> = meta
                    .indexes
                    .iter()
                    .map(|index| {
                        let mut idx = Document::new();
                        idx.insert("name", index.name.clone());
                        let mut keys = Document::new();
                        for (field, direction) in &index.keys {
                            keys.insert(field.clone(), *direction);
                        }
                        idx.insert("keys", keys);
                        idx.insert("unique", index.unique);
                        idx.insert("rootPageId", index.root_page_id as i64);
                        Value::Document(idx)
                    })
                    .collect();
                doc.insert("indexes", indexes);
                Value::Document(doc)
            })
            .collect();
        root.insert("collections", collections);
        root
    }

    fn from_document(doc: &Document) -> Result<Self> {
        let mut catalog = Self::default();
        let collections = match doc.get("collections") {
            Some(Value::Array(items)) => items,
            _ => return Ok(catalog),
        };

        for item in collections {
            let entry = item
                .as_document()
                .ok_or_else(|| eyre::eyre!("catalog collection entry is not a document"))?;
            let mut meta = CollectionMeta {
                name: require_str(entry, "name")?.to_string(),
                first_page_id: require_page_id(entry, "firstPageId")?,
                last_page_id: require_page_id(entry, "lastPageId")?,
                document_count: entry
                    .get("documentCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as u64,
                index_page_id: entry
                    .get("indexPageId")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as u32,
                indexes: Vec::new(),
            };

            if let Some(Value::Array(indexes)) = entry.get("indexes") {
                for index in indexes {
                    let index_doc = index
                        .as_document()
                        .ok_or_else(|| eyre::eyre!("catalog index entry is not a document"))?;
                    let mut keys = Vec::new();
                    if let Some(Value::Document(key_doc)) = index_doc.get("keys") {
                        for (field, direction) in key_doc.iter() {
                            keys.push((
                                field.to_string(),
                                direction.as_i64().unwrap_or(1) as i32,
                            ));
                        }
                    }
                    meta.indexes.push(IndexMeta {
                        name: require_str(index_doc, "name")?.to_string(),
                        keys,
                        unique: index_doc
                            .get("unique")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                        root_page_id: require_page_id(index_doc, "rootPageId")?,
                    });
                }
            }
            catalog.collections.push(meta);
        }
        Ok(catalog)
    }
}

fn require_str<'a>(doc: &'a Document, field: &str) -> Result<&'a str> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| eyre::eyre!("catalog entry missing string field '{}'", field))
}

fn require_page_id(doc: &Document, field: &str) -> Result<u32> {
    let raw = doc
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| eyre::eyre!("catalog entry missing page id field '{}'", field))?;
    ensure!(
        (0..=u32::MAX as i64).contains(&raw),
        "catalog page id '{}' out of range: {}",
        field,
        raw
    );
    Ok(raw as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagerOptions;
    use tempfile::tempdir;

    fn sample_catalog(collections: usize, indexes_per: usize) -> Catalog {
        let mut catalog = Catalog::default();
        for c in 0..collections {
            let mut meta = CollectionMeta {
                name: format!("collection_{:03}", c),
                first_page_id: (c * 10 + 1) as u32,
                last_page_id: (c * 10 + 5) as u32,
                document_count: (c * 100) as u64,
                index_page_id: 0,
                indexes: Vec::new(),
            };
            for i in 0..indexes_per {
                meta.indexes.push(IndexMeta {
                    name: format!("idx_{}_{}", c, i),
                    keys: vec![(format!("field_{}", i), if i % 2 == 0 { 1 } else { -1 })],
                    unique: i == 0,
                    root_page_id: (c * 10 + i + 100) as u32,
                });
            }
            catalog.collections.push(meta);
        }
        catalog
    }

    #[test]
    fn document_roundtrip_preserves_everything() {
        let catalog = sample_catalog(3, 2);

        let doc = catalog.to_document();
        let restored = Catalog::from_document(&doc).unwrap();

        assert_eq!(restored, catalog);
    }

    #[test]
    fn empty_database_loads_empty_catalog() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap();

        let catalog = Catalog::load(&mut pager).unwrap();
        assert!(catalog.collections.is_empty());
    }

    #[test]
    fn single_page_save_and_load() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap();

        let catalog = sample_catalog(2, 1);
        catalog.save(&mut pager).unwrap();

        assert_ne!(pager.catalog_page_id(), 0);
        let loaded = Catalog::load(&mut pager).unwrap();
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn oversized_catalog_chains_across_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap();

        let catalog = sample_catalog(200, 5);
        catalog.save(&mut pager).unwrap();

        // The first chain page carries the multi-page magic.
        let head = pager.read_page(pager.catalog_page_id()).unwrap();
        let lead = u32::from_le_bytes(head.data()[..4].try_into().unwrap());
        assert_eq!(lead, CATALOG_CHAIN_MAGIC);
        assert_ne!(head.next_page_id(), 0);

        let loaded = Catalog::load(&mut pager).unwrap();
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn chain_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let catalog = sample_catalog(200, 5);

        {
            let mut pager = Pager::open(&path, PagerOptions::default()).unwrap();
            catalog.save(&mut pager).unwrap();
            pager.close().unwrap();
        }

        let mut pager = Pager::open(&path, PagerOptions::default()).unwrap();
        let loaded = Catalog::load(&mut pager).unwrap();
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn shrinking_catalog_frees_surplus_chain_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap();

        sample_catalog(200, 5).save(&mut pager).unwrap();
        let free_before = pager.free_list_len();

        let small = sample_catalog(1, 1);
        small.save(&mut pager).unwrap();

        assert!(pager.free_list_len() > free_before, "no chain pages freed");
        assert_eq!(Catalog::load(&mut pager).unwrap(), small);
    }

    #[test]
    fn regrowing_catalog_reuses_freed_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap();

        sample_catalog(200, 5).save(&mut pager).unwrap();
        sample_catalog(1, 1).save(&mut pager).unwrap();
        let count_small = pager.page_count();

        sample_catalog(200, 5).save(&mut pager).unwrap();

        // Regrowth draws from the free list before extending the file.
        assert_eq!(pager.page_count(), count_small);
    }
}
