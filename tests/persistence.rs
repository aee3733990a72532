//! # Persistence Tests
//!
//! Everything written before `flush(); close()` must be readable after a
//! fresh `open()`: documents, collection metadata, index definitions, and
//! multi-page catalogs.

use monodb::{doc, Database, Document, Value};
use tempfile::tempdir;

mod document_persistence {
    use super::*;

    #[test]
    fn single_document_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");

        {
            let mut db = Database::open(&path).unwrap();
            let mut users = db.collection("users").unwrap();
            users
                .insert_one(doc! { "name" => "Alice", "age" => 30 })
                .unwrap();
            db.flush().unwrap();
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let mut users = db.collection("users").unwrap();
        let results = users.find(&doc! { "name" => "Alice" }).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("age"), Some(&Value::Int32(30)));
    }

    #[test]
    fn many_documents_survive_across_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");

        {
            let mut db = Database::open(&path).unwrap();
            let mut items = db.collection("items").unwrap();
            let docs: Vec<Document> = (0..1000)
                .map(|i| doc! { "_id" => i, "label" => format!("item-{}", i) })
                .collect();
            items.insert_many(docs).unwrap();
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let mut items = db.collection("items").unwrap();

        assert_eq!(items.count(), 1000);
        let item = items.find_one(&doc! { "_id" => 777 }).unwrap().unwrap();
        assert_eq!(
            item.get("label"),
            Some(&Value::String("item-777".to_string()))
        );
    }

    #[test]
    fn field_order_is_stable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");

        {
            let mut db = Database::open(&path).unwrap();
            let mut docs = db.collection("docs").unwrap();
            docs.insert_one(doc! { "_id" => 1, "z" => 1, "a" => 2, "m" => 3 })
                .unwrap();
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let mut docs = db.collection("docs").unwrap();
        let found = docs.find_one(&doc! { "_id" => 1 }).unwrap().unwrap();

        let keys: Vec<&str> = found.keys().collect();
        assert_eq!(keys, vec!["_id", "z", "a", "m"]);
    }

    #[test]
    fn oversized_documents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");
        let payload = "x".repeat(50_000);

        {
            let mut db = Database::open(&path).unwrap();
            let mut blobs = db.collection("blobs").unwrap();
            blobs
                .insert_one(doc! { "_id" => 1, "payload" => payload.clone() })
                .unwrap();
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let mut blobs = db.collection("blobs").unwrap();
        let found = blobs.find_one(&doc! { "_id" => 1 }).unwrap().unwrap();

        assert_eq!(found.get("payload"), Some(&Value::String(payload)));
    }
}

mod catalog_persistence {
    use super::*;

    #[test]
    fn large_catalog_with_many_indexed_collections_reloads_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");

        let mut expected: Vec<(String, Vec<String>)> = Vec::new();
        {
            let mut db = Database::open(&path).unwrap();
            for c in 0..200 {
                let name = format!("collection_{:03}", c);
                let mut collection = db.collection(&name).unwrap();
                let mut index_names = Vec::new();
                for i in 0..5 {
                    let spec = doc! { format!("field_{}", i) => if i % 2 == 0 { 1 } else { -1 } };
                    index_names.push(collection.create_index(&spec, i == 0).unwrap());
                }
                expected.push((name, index_names));
            }
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        assert_eq!(db.collection_names().len(), 200);

        for (name, index_names) in &expected {
            let collection = db.collection(name).unwrap();
            let indexes = collection.list_indexes();
            assert_eq!(indexes.len(), 5, "collection {} lost indexes", name);

            let loaded: Vec<String> = indexes.iter().map(|m| m.name.clone()).collect();
            assert_eq!(&loaded, index_names, "index names differ in {}", name);
            for meta in &indexes {
                assert_ne!(meta.root_page_id, 0, "index {} lost its root", meta.name);
                assert_eq!(meta.keys.len(), 1);
            }
            assert!(indexes[0].unique);
            assert!(!indexes[1].unique);
        }
    }

    #[test]
    fn index_contents_remain_queryable_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.mono");

        {
            let mut db = Database::open(&path).unwrap();
            let mut users = db.collection("users").unwrap();
            let docs: Vec<Document> = (0..500)
                .map(|i| doc! { "_id" => i, "email" => format!("user{}@example.com", i) })
                .collect();
            users.insert_many(docs).unwrap();
            users.create_index(&doc! { "email" => 1 }, true).unwrap();
            db.close().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let mut users = db.collection("users").unwrap();

        // The reloaded unique index still rejects collisions.
        let err = users
            .insert_one(doc! { "_id" => 999, "email" => "user42@example.com" })
            .unwrap_err();
        assert!(monodb::error::is_duplicate_key(&err));
        assert_eq!(users.count(), 500);
    }
}
