//! End-to-end runs over a real on-disk repository, driving the engine the
//! way the CLI does: open, store, mutate the remote, store again, prune.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use sha2::{Digest, Sha256};

use photark_core::commands::store::StoreRequest;
use photark_core::commands::{prune, store};
use photark_core::error::{PhotarkError, Result};
use photark_core::provider::{Client, Collection, Item, Provider, Registry};
use photark_core::repo::Repository;

// ---------------------------------------------------------------------------
// A scriptable fake provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeItem {
    id: String,
    name: String,
    etag: String,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct FakeCollection {
    id: String,
    name: String,
    items: Vec<FakeItem>,
}

struct FakeService {
    collections: Mutex<Vec<FakeCollection>>,
}

impl FakeService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, collections: Vec<FakeCollection>) {
        *self.collections.lock().unwrap() = collections;
    }
}

impl Collection for FakeCollection {
    fn collection_id(&self) -> &str {
        &self.id
    }

    fn collection_name(&self) -> &str {
        &self.name
    }
}

impl Item for FakeItem {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn item_name(&self) -> &str {
        &self.name
    }

    fn item_etag(&self) -> &str {
        &self.etag
    }
}

impl Client for FakeService {
    fn name(&self) -> &str {
        "fake"
    }

    fn list_collections(&self) -> Result<Vec<Box<dyn Collection>>> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .iter()
            .map(|c| Box::new(c.clone()) as Box<dyn Collection>)
            .collect())
    }

    fn list_collection_items(
        &self,
        collection: &dyn Collection,
        items: Sender<Box<dyn Item>>,
    ) -> Result<()> {
        let listed = self
            .collections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == collection.collection_id())
            .map(|c| c.items.clone())
            .unwrap_or_default();
        for item in listed {
            if items.send(Box::new(item)).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn download(&self, item: &dyn Item, dest: &mut dyn Write) -> Result<()> {
        let collections = self.collections.lock().unwrap();
        for coll in collections.iter() {
            if let Some(found) = coll.items.iter().find(|i| i.id == item.item_id()) {
                dest.write_all(&found.content)?;
                return Ok(());
            }
        }
        Err(PhotarkError::Provider(format!(
            "unknown item '{}'",
            item.item_id()
        )))
    }
}

fn coll(id: &str, name: &str, items: &[(&str, &str, &str, &[u8])]) -> FakeCollection {
    FakeCollection {
        id: id.to_string(),
        name: name.to_string(),
        items: items
            .iter()
            .map(|(id, name, etag, content)| FakeItem {
                id: id.to_string(),
                name: name.to_string(),
                etag: etag.to_string(),
                content: content.to_vec(),
            })
            .collect(),
    }
}

fn registry(service: &Arc<FakeService>) -> Registry {
    let service = Arc::clone(service);
    let mut registry = Registry::new();
    registry.register(Provider {
        name: "fake".to_string(),
        title: "Fake".to_string(),
        accounts: vec!["someone@example.com".to_string()],
        credentials: Box::new(|_| Ok(b"fake-token".to_vec())),
        new_client: Box::new(move |_| Ok(Arc::clone(&service) as Arc<dyn Client>)),
    });
    registry
}

fn open(dir: &Path, service: &Arc<FakeService>) -> Repository {
    Repository::open(dir, registry(service)).unwrap()
}

fn request() -> StoreRequest {
    StoreRequest {
        save_everything: false,
        check_integrity: false,
        workers: 1,
    }
}

const ACCT: &str = "fake:someone@example.com";
const ACCT_DIR: &str = "fake/someone_at_example.com";

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn full_backup_and_prune_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    service.set(vec![coll("a", "Alps", &[("p1", "p1.jpg", "e1", b"one")])]);

    let repo = open(dir.path(), &service);
    store::run(&repo, &request()).unwrap();
    assert_eq!(
        fs::read(dir.path().join(ACCT_DIR).join("Alps/p1.jpg")).unwrap(),
        b"one"
    );

    // A second album appears, sharing p1 and adding p2.
    service.set(vec![
        coll("a", "Alps", &[("p1", "p1.jpg", "e1", b"one")]),
        coll(
            "b",
            "Best of",
            &[("p1", "p1.jpg", "e1", b"one"), ("p2", "p2.jpg", "e1", b"two")],
        ),
    ]);
    store::run(&repo, &request()).unwrap();

    let best_of = dir.path().join(ACCT_DIR).join("Best of");
    assert_eq!(fs::read(best_of.join("p2.jpg")).unwrap(), b"two");
    let pointers = fs::read_to_string(best_of.join("others.txt")).unwrap();
    assert_eq!(pointers, format!("{ACCT_DIR}/Alps/p1.jpg\n"));

    // The original album is deleted remotely; p1's canonical file must
    // survive by moving into "Best of".
    service.set(vec![coll(
        "b",
        "Best of",
        &[("p1", "p1.jpg", "e1", b"one"), ("p2", "p2.jpg", "e1", b"two")],
    )]);
    prune::run(&repo).unwrap();

    assert!(!dir.path().join(ACCT_DIR).join("Alps").exists());
    assert_eq!(fs::read(best_of.join("p1.jpg")).unwrap(), b"one");
    assert!(!best_of.join("others.txt").exists());

    let p1 = repo.index().load_item(ACCT, "p1").unwrap().unwrap();
    assert_eq!(p1.file_path, format!("{ACCT_DIR}/Best of/p1.jpg"));
    assert_eq!(p1.collections.iter().collect::<Vec<_>>(), vec!["b"]);

    // Finally everything disappears.
    service.set(vec![]);
    prune::run(&repo).unwrap();
    assert!(!best_of.exists());
    assert!(repo.index().load_item(ACCT, "p1").unwrap().is_none());
    assert!(repo.index().load_item(ACCT, "p2").unwrap().is_none());
}

#[test]
fn repository_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    service.set(vec![coll("a", "Alps", &[("p1", "p1.jpg", "e1", b"one")])]);

    {
        let repo = open(dir.path(), &service);
        store::run(&repo, &request()).unwrap();
        repo.close();
    }

    let repo = open(dir.path(), &service);
    let p1 = repo.index().load_item(ACCT, "p1").unwrap().unwrap();
    assert_eq!(p1.etag, "e1");
    assert_eq!(
        p1.checksum,
        Sha256::digest(b"one").to_vec()
    );

    // Credentials were persisted on the first open, so a reopened repo is
    // already authorized.
    assert_eq!(
        repo.index().load_credentials(ACCT).unwrap(),
        Some(b"fake-token".to_vec())
    );

    // An unchanged remote means an idempotent second run.
    store::run(&repo, &request()).unwrap();
    let entries: Vec<String> = fs::read_dir(dir.path().join(ACCT_DIR).join("Alps"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries, vec!["p1.jpg"]);
}

#[test]
fn a_second_process_fails_fast_on_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    let _held = open(dir.path(), &service);

    let err = Repository::open(dir.path(), registry(&service)).unwrap_err();
    assert!(matches!(err, PhotarkError::IndexLocked(_)), "{err}");
}

#[test]
fn authorize_all_accounts_persists_credentials_without_downloading() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    service.set(vec![coll("a", "Alps", &[("p1", "p1.jpg", "e1", b"one")])]);

    let repo = open(dir.path(), &service);
    repo.authorize_all_accounts().unwrap();

    assert_eq!(
        repo.index().load_credentials(ACCT).unwrap(),
        Some(b"fake-token".to_vec())
    );
    // Nothing was listed or downloaded.
    assert!(!dir.path().join(ACCT_DIR).exists());
}

#[test]
fn dedup_across_accounts_of_one_run_is_deterministic() {
    // Two items with identical bytes in two albums: exactly one canonical
    // file, one pointer line, a two-entry checksum bucket.
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    service.set(vec![
        coll("a", "Alps", &[("p1", "p1.jpg", "e1", b"same bytes")]),
        coll("b", "Tahoe", &[("p2", "p2.jpg", "e1", b"same bytes")]),
    ]);

    let repo = open(dir.path(), &service);
    store::run(&repo, &request()).unwrap();

    assert!(dir.path().join(ACCT_DIR).join("Alps/p1.jpg").exists());
    assert!(!dir.path().join(ACCT_DIR).join("Tahoe/p2.jpg").exists());
    let pointers =
        fs::read_to_string(dir.path().join(ACCT_DIR).join("Tahoe/others.txt")).unwrap();
    assert_eq!(pointers.lines().count(), 1);

    let checksum = Sha256::digest(b"same bytes");
    let bucket = repo.index().items_with_checksum(&checksum).unwrap();
    let ids: Vec<&str> = bucket.iter().map(|e| e.item_id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
}

#[test]
fn membership_map_is_consistent_after_mixed_runs() {
    // Invariant: every collection's item set equals the set of items that
    // claim membership in it.
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::new();
    let shared: &[u8] = b"shared";
    service.set(vec![
        coll("a", "Alps", &[("p1", "p1.jpg", "e1", shared), ("p2", "p2.jpg", "e1", b"two")]),
        coll("b", "Best of", &[("p1", "p1.jpg", "e1", shared)]),
    ]);

    let repo = open(dir.path(), &service);
    store::run(&repo, &request()).unwrap();

    service.set(vec![
        coll("a", "Alps", &[("p2", "p2.jpg", "e1", b"two")]),
        coll("b", "Best of", &[("p1", "p1.jpg", "e1", shared)]),
    ]);
    prune::run(&repo).unwrap();
    store::run(&repo, &request()).unwrap();

    let mut claimed: HashMap<String, Vec<String>> = HashMap::new();
    for item_id in ["p1", "p2"] {
        let item = repo.index().load_item(ACCT, item_id).unwrap().unwrap();
        for coll_id in &item.collections {
            claimed
                .entry(coll_id.clone())
                .or_default()
                .push(item_id.to_string());
        }
    }
    for coll_id in repo.index().collection_ids(ACCT).unwrap() {
        let coll = repo.index().load_collection(ACCT, &coll_id).unwrap().unwrap();
        let mut expected = claimed.remove(&coll_id).unwrap_or_default();
        expected.sort();
        let stored: Vec<String> = coll.items.iter().cloned().collect();
        assert_eq!(stored, expected, "collection '{coll_id}' out of sync");
    }
    assert!(claimed.is_empty(), "items claim unknown collections: {claimed:?}");
}
