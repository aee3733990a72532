//! # Index Manager
//!
//! Binds B+Trees to collections and keeps them coherent with document
//! mutations.
//!
//! ## Key encoding
//!
//! An index key is the concatenation of the codec encodings of each
//! projected field value, in index-spec order. A missing field contributes
//! a single 0x00 byte. Non-unique indexes append `0x00` plus the encoded
//! `{_id: <docId>}` document, which makes every tree key distinct while
//! keeping entries clustered by the logical key for range scans.
//!
//! The stored tree value is the encoded `{_id: <docId>}` document for both
//! variants, so an index hit can be resolved back to its document.
//!
//! ## Uniqueness
//!
//! A unique index's tree rejects an exact duplicate key. Non-unique
//! indexes never collide at the tree level by construction of the suffix.
//! Callers pre-check unique constraints before writing a document and roll
//! the document back when a later entry insert still fails.

use eyre::{Result, WrapErr};

use crate::btree::BTree;
use crate::catalog::IndexMeta;
use crate::document::{encode_document, encode_value, Document, Value};
use crate::error::DbError;
use crate::query::lookup_path;
use crate::storage::Pager;

/// Conventional index name: `field_1` for ascending, `field_-1` for
/// descending, joined with underscores for compound specs.
pub fn default_index_name(keys: &[(String, i32)]) -> String {
    keys.iter()
        .map(|(field, direction)| format!("{}_{}", field, direction))
        .collect::<Vec<_>>()
        .join("_")
}

/// Projects a document onto an index spec, producing the tree key.
pub fn encode_index_key(doc: &Document, meta: &IndexMeta) -> Result<Vec<u8>> {
    let mut key = Vec::new();
    for (field, _direction) in &meta.keys {
        match lookup_path(doc, field) {
            Some(value) => encode_value(&mut key, value)?,
            None => key.push(0x00),
        }
    }
    if !meta.unique {
        key.push(0x00);
        key.extend_from_slice(&encode_id_value(document_id(doc)?)?);
    }
    Ok(key)
}

/// The tree value: an encoded `{_id: <docId>}` document.
pub fn encode_id_value(id: &Value) -> Result<Vec<u8>> {
    let mut doc = Document::new();
    doc.insert("_id", id.clone());
    encode_document(&doc)
}

fn document_id(doc: &Document) -> Result<&Value> {
    doc.get("_id")
        .ok_or_else(|| eyre::eyre!("document has no _id field"))
}

/// Fails with `DuplicateKey` when any unique index already holds this
/// document's projected key.
pub fn check_unique(pager: &mut Pager, indexes: &[IndexMeta], doc: &Document) -> Result<()> {
    for meta in indexes.iter().filter(|meta| meta.unique) {
        let key = encode_index_key(doc, meta)?;
        let mut tree = BTree::open(pager, meta.root_page_id, true)?;
        if tree.search(&key)?.is_some() {
            let report: eyre::Report = DbError::DuplicateKey.into();
            return Err(report.wrap_err(format!("index '{}'", meta.name)));
        }
    }
    Ok(())
}

/// Mirrors a freshly written document into every index. On failure the
/// entries already inserted for this document are removed before the error
/// propagates; root page movements are written back into the metas.
pub fn insert_entries(
    pager: &mut Pager,
    indexes: &mut [IndexMeta],
    doc: &Document,
) -> Result<()> {
    let value = encode_id_value(document_id(doc)?)?;

    for i in 0..indexes.len() {
        let key = encode_index_key(doc, &indexes[i])?;
        let result = {
            let meta = &mut indexes[i];
            let mut tree = BTree::open(pager, meta.root_page_id, meta.unique)?;
            let outcome = tree.insert(&key, &value);
            meta.root_page_id = tree.root_page();
            outcome
        };

        if let Err(err) = result {
            let err = err.wrap_err(format!("index '{}'", indexes[i].name));
            remove_entries_up_to(pager, indexes, doc, i)?;
            return Err(err);
        }
    }
    Ok(())
}

/// Removes this document's entries from every index. Absent entries are
/// tolerated; deletes are idempotent.
pub fn remove_entries(pager: &mut Pager, indexes: &mut [IndexMeta], doc: &Document) -> Result<()> {
    remove_entries_up_to(pager, indexes, doc, indexes.len())
}

fn remove_entries_up_to(
    pager: &mut Pager,
    indexes: &mut [IndexMeta],
    doc: &Document,
    end: usize,
) -> Result<()> {
    for meta in indexes[..end].iter_mut() {
        let key = encode_index_key(doc, meta)?;
        let mut tree = BTree::open(pager, meta.root_page_id, meta.unique)?;
        tree.delete(&key)
            .wrap_err_with(|| format!("removing entry from index '{}'", meta.name))?;
        meta.root_page_id = tree.root_page();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::ObjectId;
    use crate::storage::PagerOptions;
    use tempfile::tempdir;

    fn test_pager(dir: &tempfile::TempDir) -> Pager {
        Pager::open(&dir.path().join("db"), PagerOptions::default()).unwrap()
    }

    fn make_index(pager: &mut Pager, keys: Vec<(String, i32)>, unique: bool) -> IndexMeta {
        let tree = BTree::create(pager, unique).unwrap();
        IndexMeta {
            name: default_index_name(&keys),
            keys,
            unique,
            root_page_id: tree.root_page(),
        }
    }

    #[test]
    fn default_names_follow_field_direction_convention() {
        assert_eq!(
            default_index_name(&[("age".to_string(), 1)]),
            "age_1"
        );
        assert_eq!(
            default_index_name(&[("a".to_string(), 1), ("b".to_string(), -1)]),
            "a_1_b_-1"
        );
    }

    #[test]
    fn unique_keys_differ_by_projected_value_only() {
        let meta = IndexMeta {
            name: "k_1".into(),
            keys: vec![("k".into(), 1)],
            unique: true,
            root_page_id: 1,
        };

        let a = encode_index_key(&doc! { "_id" => 1, "k" => "same" }, &meta).unwrap();
        let b = encode_index_key(&doc! { "_id" => 2, "k" => "same" }, &meta).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_unique_keys_carry_the_document_id() {
        let meta = IndexMeta {
            name: "k_1".into(),
            keys: vec![("k".into(), 1)],
            unique: false,
            root_page_id: 1,
        };

        let a = encode_index_key(&doc! { "_id" => 1, "k" => "same" }, &meta).unwrap();
        let b = encode_index_key(&doc! { "_id" => 2, "k" => "same" }, &meta).unwrap();
        assert_ne!(a, b);

        let logical = encode_index_key(&doc! { "_id" => 1, "k" => "same" }, &IndexMeta {
            unique: true,
            ..meta
        })
        .unwrap();
        assert!(a.starts_with(&logical));
        assert!(b.starts_with(&logical));
    }

    #[test]
    fn missing_field_encodes_one_null_byte() {
        let meta = IndexMeta {
            name: "gone_1".into(),
            keys: vec![("gone".into(), 1)],
            unique: true,
            root_page_id: 1,
        };

        let key = encode_index_key(&doc! { "_id" => 1 }, &meta).unwrap();
        assert_eq!(key, vec![0x00]);
    }

    #[test]
    fn dotted_paths_project_nested_fields() {
        let meta = IndexMeta {
            name: "addr.city_1".into(),
            keys: vec![("addr.city".into(), 1)],
            unique: true,
            root_page_id: 1,
        };

        let a = encode_index_key(
            &doc! { "_id" => 1, "addr" => doc! { "city" => "Oslo" } },
            &meta,
        )
        .unwrap();
        let b = encode_index_key(
            &doc! { "_id" => 2, "addr" => doc! { "city" => "Bergen" } },
            &meta,
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn check_unique_flags_existing_key() {
        let dir = tempdir().unwrap();
        let mut pager = test_pager(&dir);
        let mut indexes = vec![make_index(&mut pager, vec![("k".into(), 1)], true)];

        let first = doc! { "_id" => 1, "k" => "taken" };
        insert_entries(&mut pager, &mut indexes, &first).unwrap();

        check_unique(&mut pager, &indexes, &doc! { "_id" => 2, "k" => "free" }).unwrap();
        let err = check_unique(&mut pager, &indexes, &doc! { "_id" => 3, "k" => "taken" })
            .unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));
    }

    #[test]
    fn insert_entries_rolls_back_earlier_indexes_on_conflict() {
        let dir = tempdir().unwrap();
        let mut pager = test_pager(&dir);
        let mut indexes = vec![
            make_index(&mut pager, vec![("a".into(), 1)], false),
            make_index(&mut pager, vec![("b".into(), 1)], true),
        ];

        insert_entries(
            &mut pager,
            &mut indexes,
            &doc! { "_id" => 1, "a" => 1, "b" => "clash" },
        )
        .unwrap();

        // Second document: the non-unique 'a' entry lands first, then 'b'
        // collides; the 'a' entry must be removed again.
        let err = insert_entries(
            &mut pager,
            &mut indexes,
            &doc! { "_id" => 2, "a" => 1, "b" => "clash" },
        )
        .unwrap_err();
        assert!(crate::error::is_duplicate_key(&err));

        let meta = indexes[0].clone();
        let key = encode_index_key(&doc! { "_id" => 2, "a" => 1 }, &meta).unwrap();
        let mut tree = BTree::open(&mut pager, meta.root_page_id, false).unwrap();
        assert!(tree.search(&key).unwrap().is_none(), "ghost entry left behind");
    }

    #[test]
    fn remove_entries_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut pager = test_pager(&dir);
        let mut indexes = vec![make_index(&mut pager, vec![("k".into(), 1)], true)];
        let doc = doc! { "_id" => ObjectId::generate(), "k" => 5 };

        insert_entries(&mut pager, &mut indexes, &doc).unwrap();
        remove_entries(&mut pager, &mut indexes, &doc).unwrap();
        remove_entries(&mut pager, &mut indexes, &doc).unwrap();

        check_unique(&mut pager, &indexes, &doc).unwrap();
    }

    #[test]
    fn root_movement_is_written_back_to_meta() {
        let dir = tempdir().unwrap();
        let mut pager = test_pager(&dir);
        let mut indexes = vec![make_index(&mut pager, vec![("n".into(), 1)], true)];
        let original_root = indexes[0].root_page_id;

        for i in 0..500 {
            let doc = doc! { "_id" => i, "n" => i };
            insert_entries(&mut pager, &mut indexes, &doc).unwrap();
        }

        assert_ne!(indexes[0].root_page_id, original_root, "root never split");

        let meta = indexes[0].clone();
        let key = encode_index_key(&doc! { "_id" => 250, "n" => 250 }, &meta).unwrap();
        let mut tree = BTree::open(&mut pager, meta.root_page_id, true).unwrap();
        assert!(tree.search(&key).unwrap().is_some());
    }
}
