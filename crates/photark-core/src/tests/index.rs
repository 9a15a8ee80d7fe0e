use std::collections::BTreeSet;

use chrono::Utc;

use crate::error::PhotarkError;
use crate::index::{AccountItem, CollectionMeta, DbCollection, DbItem, Index, ItemMeta};

fn open_index(dir: &tempfile::TempDir) -> Index {
    Index::open(&dir.path().join("photobak.db")).unwrap()
}

fn item(id: &str, checksum: u8, collections: &[&str]) -> DbItem {
    DbItem {
        id: id.to_string(),
        name: format!("{id}.jpg"),
        file_name: format!("{id}.jpg"),
        file_path: format!("memory/user/A/{id}.jpg"),
        checksum: vec![checksum; 32],
        etag: "e1".to_string(),
        saved: Utc::now(),
        collections: collections.iter().map(|c| c.to_string()).collect(),
        meta: ItemMeta::default(),
    }
}

fn collection(id: &str, items: &[&str]) -> DbCollection {
    DbCollection {
        id: id.to_string(),
        name: id.to_uppercase(),
        dir_name: id.to_uppercase(),
        dir_path: format!("memory/user/{}", id.to_uppercase()),
        saved: Utc::now(),
        items: items.iter().map(|i| i.to_string()).collect(),
        meta: CollectionMeta::default(),
    }
}

#[test]
fn credentials_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index.create_account("memory:user").unwrap();
    assert_eq!(index.load_credentials("memory:user").unwrap(), None);

    index.save_credentials("memory:user", b"token").unwrap();
    assert_eq!(
        index.load_credentials("memory:user").unwrap(),
        Some(b"token".to_vec())
    );
}

#[test]
fn item_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    assert!(index.load_item("memory:user", "p").unwrap().is_none());
    index.save_item("memory:user", "p", &item("p", 1, &["a"])).unwrap();

    let loaded = index.load_item("memory:user", "p").unwrap().unwrap();
    assert_eq!(loaded.id, "p");
    assert_eq!(loaded.checksum, vec![1u8; 32]);
    assert_eq!(loaded.collections, BTreeSet::from(["a".to_string()]));
}

#[test]
fn save_item_populates_checksum_bucket_once() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index.save_item("memory:user", "p", &item("p", 1, &["a"])).unwrap();
    index.save_item("memory:user", "p", &item("p", 1, &["a"])).unwrap();

    let bucket = index.items_with_checksum(&[1u8; 32]).unwrap();
    assert_eq!(
        bucket,
        vec![AccountItem {
            acct_key: "memory:user".to_string(),
            item_id: "p".to_string(),
        }]
    );
}

#[test]
fn changed_checksum_moves_between_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index.save_item("memory:user", "p1", &item("p1", 1, &["a"])).unwrap();
    index.save_item("memory:user", "p2", &item("p2", 1, &["b"])).unwrap();
    assert_eq!(index.items_with_checksum(&[1u8; 32]).unwrap().len(), 2);

    // p1's content changed remotely: it leaves the old bucket and seeds a
    // new one.
    index.save_item("memory:user", "p1", &item("p1", 9, &["a"])).unwrap();

    let old = index.items_with_checksum(&[1u8; 32]).unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].item_id, "p2");
    let new = index.items_with_checksum(&[9u8; 32]).unwrap();
    assert_eq!(new.len(), 1);
    assert_eq!(new[0].item_id, "p1");
}

#[test]
fn delete_item_detaches_from_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index.save_item("memory:user", "p1", &item("p1", 1, &["a"])).unwrap();
    index.save_item("memory:user", "p2", &item("p2", 1, &["a"])).unwrap();

    index.delete_item("memory:user", "p1").unwrap();
    assert!(index.load_item("memory:user", "p1").unwrap().is_none());
    assert_eq!(index.items_with_checksum(&[1u8; 32]).unwrap().len(), 1);

    // Deleting the last holder empties the bucket entirely.
    index.delete_item("memory:user", "p2").unwrap();
    assert!(index.items_with_checksum(&[1u8; 32]).unwrap().is_empty());

    // And deleting a missing item is a no-op.
    index.delete_item("memory:user", "p1").unwrap();
}

#[test]
fn save_item_links_known_collections() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index
        .save_collection("memory:user", "a", &collection("a", &[]))
        .unwrap();
    index.save_item("memory:user", "p", &item("p", 1, &["a"])).unwrap();

    let coll = index.load_collection("memory:user", "a").unwrap().unwrap();
    assert!(coll.items.contains("p"));
}

#[test]
fn attach_item_updates_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index
        .save_collection("memory:user", "b", &collection("b", &[]))
        .unwrap();
    index.save_item("memory:user", "p", &item("p", 1, &["a"])).unwrap();

    index
        .attach_item_to_collection("memory:user", "p", "b")
        .unwrap();

    let loaded = index.load_item("memory:user", "p").unwrap().unwrap();
    assert!(loaded.collections.contains("b"));
    let coll = index.load_collection("memory:user", "b").unwrap().unwrap();
    assert!(coll.items.contains("p"));
}

#[test]
fn attach_to_missing_collection_fails() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index.save_item("memory:user", "p", &item("p", 1, &[])).unwrap();
    let err = index
        .attach_item_to_collection("memory:user", "p", "nope")
        .unwrap_err();
    assert!(matches!(err, PhotarkError::MissingCollection(_)), "{err}");
}

#[test]
fn register_collection_preserves_membership() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index
        .save_collection("memory:user", "a", &collection("a", &["p", "q"]))
        .unwrap();
    // A later backup pass registers the same collection with a fresh
    // (empty) membership set; the stored one must survive.
    index
        .register_collection("memory:user", "a", &collection("a", &[]))
        .unwrap();

    let coll = index.load_collection("memory:user", "a").unwrap().unwrap();
    assert_eq!(coll.items.len(), 2);
}

#[test]
fn collection_ids_are_scoped_per_account() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);

    index
        .save_collection("memory:user", "a", &collection("a", &[]))
        .unwrap();
    index
        .save_collection("memory:user", "b", &collection("b", &[]))
        .unwrap();
    index
        .save_collection("other:user", "c", &collection("c", &[]))
        .unwrap();

    assert_eq!(index.collection_ids("memory:user").unwrap(), vec!["a", "b"]);
    assert_eq!(index.collection_ids("other:user").unwrap(), vec!["c"]);
    assert!(index.collection_ids("memory:nobody").unwrap().is_empty());
}

#[test]
fn second_open_times_out_on_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let _held = open_index(&dir);

    let err = Index::open(&dir.path().join("photobak.db")).unwrap_err();
    assert!(matches!(err, PhotarkError::IndexLocked(_)), "{err}");
}
