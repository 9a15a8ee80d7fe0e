use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::error::{PhotarkError, Result};
use crate::provider::{Client, Collection, Item, Provider, Registry};
use crate::repo::Repository;

/// Scriptable in-memory provider for testing. Thread-safe via Mutex;
/// the remote state can be swapped between runs with `set_collections`.
pub(crate) struct MemoryClient {
    collections: Mutex<Vec<MemoryCollection>>,
    /// item id -> remaining downloads that should fail
    failures: Mutex<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryCollection {
    pub id: String,
    pub name: String,
    pub items: Vec<MemoryItem>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryItem {
    pub id: String,
    pub name: String,
    pub etag: String,
    pub caption: String,
    pub content: Vec<u8>,
}

impl MemoryCollection {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<MemoryItem>) -> Self {
        self.items = items;
        self
    }
}

impl MemoryItem {
    pub fn new(id: &str, name: &str, content: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            etag: format!("etag-{id}"),
            caption: String::new(),
            content: content.to_vec(),
        }
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = etag.to_string();
        self
    }
}

impl MemoryClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the remote state wholesale.
    pub fn set_collections(&self, collections: Vec<MemoryCollection>) {
        *self.collections.lock().unwrap() = collections;
    }

    /// Make the next `times` downloads of `item_id` fail.
    pub fn fail_downloads(&self, item_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
    }
}

impl Collection for MemoryCollection {
    fn collection_id(&self) -> &str {
        &self.id
    }

    fn collection_name(&self) -> &str {
        &self.name
    }

    fn raw(&self) -> Option<Vec<u8>> {
        Some(format!("collection:{}", self.id).into_bytes())
    }
}

impl Item for MemoryItem {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn item_name(&self) -> &str {
        &self.name
    }

    fn item_etag(&self) -> &str {
        &self.etag
    }

    fn item_caption(&self) -> &str {
        &self.caption
    }

    fn raw(&self) -> Option<Vec<u8>> {
        Some(format!("item:{}", self.id).into_bytes())
    }
}

impl Client for MemoryClient {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_collections(&self) -> Result<Vec<Box<dyn Collection>>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .iter()
            .map(|coll| Box::new(coll.clone()) as Box<dyn Collection>)
            .collect())
    }

    fn list_collection_items(
        &self,
        collection: &dyn Collection,
        items: Sender<Box<dyn Item>>,
    ) -> Result<()> {
        let listed = {
            let collections = self.collections.lock().unwrap();
            collections
                .iter()
                .find(|coll| coll.id == collection.collection_id())
                .map(|coll| coll.items.clone())
                .unwrap_or_default()
        };
        for item in listed {
            if items.send(Box::new(item)).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn download(&self, item: &dyn Item, dest: &mut dyn Write) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(item.item_id()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PhotarkError::Provider(format!(
                        "injected download failure for '{}'",
                        item.item_id()
                    )));
                }
            }
        }
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

/// A registry with one `memory` provider and a single account.
pub(crate) fn memory_registry(client: &Arc<MemoryClient>, username: &str) -> Registry {
    let client = Arc::clone(client);
    let mut registry = Registry::new();
    registry.register(Provider {
        name: "memory".to_string(),
        title: "Memory".to_string(),
        accounts: vec![username.to_string()],
        credentials: Box::new(|_| Ok(b"memory-token".to_vec())),
        new_client: Box::new(move |_| Ok(Arc::clone(&client) as Arc<dyn Client>)),
    });
    registry
}

/// Open a repository over `dir` wired to the memory provider, with the
/// fixed test account `memory:user`.
pub(crate) fn open_memory_repo(dir: &Path, client: &Arc<MemoryClient>) -> Repository {
    Repository::open(dir, memory_registry(client, "user")).expect("failed to open test repo")
}

/// Open a repository with no providers at all, for filesystem-level tests.
pub(crate) fn open_bare_repo(dir: &Path) -> Repository {
    Repository::open(dir, Registry::new()).expect("failed to open test repo")
}
