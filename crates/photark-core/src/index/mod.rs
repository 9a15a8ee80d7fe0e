//! Typed façade over the embedded key/value store.
//!
//! One redb file (`photobak.db`) holds five tables:
//!
//! ```text
//! accounts     provider:username            -> ()
//! credentials  provider:username            -> opaque credential bytes
//! collections  (provider:username, coll id) -> DbCollection (msgpack)
//! items        (provider:username, item id) -> DbItem (msgpack)
//! checksums    sha256                       -> Vec<AccountItem> (msgpack)
//! ```
//!
//! Every public operation here is a single transaction; callers composing
//! several of them (the move protocol, item removal) rely on the invariants
//! holding after each step plus re-convergence on the next run. The store is
//! exclusive-writer: opening the same repository from a second process fails
//! with [`PhotarkError::IndexLocked`] after a short retry window.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PhotarkError, Result};
use crate::setting::Setting;

const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("credentials");
const COLLECTIONS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("collections");
const ITEMS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("items");
const CHECKSUMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("checksums");

/// How long `open` keeps retrying when another process holds the store's
/// file lock before giving up with `IndexLocked`.
const OPEN_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const OPEN_LOCK_RETRY: Duration = Duration::from_millis(100);

/// A collection (album, bucket, or stream) as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCollection {
    /// Provider-assigned unique ID.
    pub id: String,
    /// Name as given by the provider.
    pub name: String,
    /// Directory name on disk; differs from `name` after a collision.
    pub dir_name: String,
    /// Repo-relative path to the collection directory.
    pub dir_path: String,
    /// When this collection was saved or last updated.
    pub saved: DateTime<Utc>,
    /// IDs of the items that are in this collection.
    pub items: BTreeSet<String>,
    pub meta: CollectionMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Everything the provider gave us, stored only when requested.
    pub raw: Option<Vec<u8>>,
}

/// An item as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbItem {
    /// Provider-assigned unique ID, shared across every collection the
    /// item appears in.
    pub id: String,
    /// Name as given by the provider, usually the file name.
    pub name: String,
    /// Actual file name on disk; differs from `name` after a collision.
    pub file_name: String,
    /// Repo-relative path to the single canonical copy of the item.
    pub file_path: String,
    /// SHA-256 of the contents, computed while downloading.
    pub checksum: Vec<u8>,
    /// Remote-change token given by the provider; empty when unsupported.
    pub etag: String,
    /// When this item was saved or last updated.
    pub saved: DateTime<Utc>,
    /// IDs of the collections this item appears in.
    pub collections: BTreeSet<String>,
    pub meta: ItemMeta,
}

/// Extra information about an item that the engine does not rely on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Caption/summary/description of the item.
    pub caption: String,
    /// Place and time extracted from embedded EXIF, when present.
    pub setting: Option<Setting>,
    /// Everything the provider gave us, stored only when requested.
    pub raw: Option<Vec<u8>>,
}

/// One entry of a content-hash bucket: an item that has the bucket's
/// checksum, addressed across accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountItem {
    pub acct_key: String,
    pub item_id: String,
}

#[derive(Debug)]
pub struct Index {
    db: Database,
}

impl Index {
    /// Open (creating if necessary) the index file at `path`. Retries for
    /// up to two seconds when another process holds the lock, then fails
    /// fast so a second archiver against the same repository errors out
    /// instead of queueing.
    pub fn open(path: &Path) -> Result<Self> {
        let start = Instant::now();
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(err) if is_locked(&err) => {
                    if start.elapsed() >= OPEN_LOCK_TIMEOUT {
                        return Err(PhotarkError::IndexLocked(path.display().to_string()));
                    }
                    thread::sleep(OPEN_LOCK_RETRY);
                }
                Err(err) => return Err(err.into()),
            }
        };

        let txn = db.begin_write()?;
        {
            txn.open_table(ACCOUNTS)?;
            txn.open_table(CREDENTIALS)?;
            txn.open_table(COLLECTIONS)?;
            txn.open_table(ITEMS)?;
            txn.open_table(CHECKSUMS)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    /// Record `acct_key` as a known account. Idempotent.
    pub fn create_account(&self, acct_key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut accounts = txn.open_table(ACCOUNTS)?;
            if accounts.get(acct_key)?.is_none() {
                let marker: &[u8] = &[];
                accounts.insert(acct_key, marker)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_credentials(&self, acct_key: &str) -> Result<Option<Vec<u8>>> {
        let read = self.db.begin_read()?;
        let credentials = read.open_table(CREDENTIALS)?;
        Ok(credentials.get(acct_key)?.map(|v| v.value().to_vec()))
    }

    pub fn save_credentials(&self, acct_key: &str, creds: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut credentials = txn.open_table(CREDENTIALS)?;
            credentials.insert(acct_key, creds)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_item(&self, acct_key: &str, item_id: &str) -> Result<Option<DbItem>> {
        let read = self.db.begin_read()?;
        let items = read.open_table(ITEMS)?;
        let encoded = items.get((acct_key, item_id))?.map(|v| v.value().to_vec());
        encoded
            .as_deref()
            .map(rmp_serde::from_slice)
            .transpose()
            .map_err(Into::into)
    }

    /// Persist `item`, keeping the rest of the index consistent with it:
    /// every collection in `item.collections` learns it contains the item,
    /// and the content-hash index is updated. The previous entry is
    /// detached when the checksum changed, and the new checksum's bucket
    /// gains this item exactly once.
    pub fn save_item(&self, acct_key: &str, item_id: &str, item: &DbItem) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut items = txn.open_table(ITEMS)?;
            let previous = items
                .get((acct_key, item_id))?
                .map(|v| v.value().to_vec())
                .as_deref()
                .map(rmp_serde::from_slice::<DbItem>)
                .transpose()?;
            items.insert((acct_key, item_id), rmp_serde::to_vec(item)?.as_slice())?;
            drop(items);

            let mut collections = txn.open_table(COLLECTIONS)?;
            for coll_id in &item.collections {
                let Some(encoded) = collections
                    .get((acct_key, coll_id.as_str()))?
                    .map(|v| v.value().to_vec())
                else {
                    debug!("item '{item_id}' references unknown collection '{coll_id}'");
                    continue;
                };
                let mut coll: DbCollection = rmp_serde::from_slice(&encoded)?;
                if coll.items.insert(item_id.to_string()) {
                    collections.insert(
                        (acct_key, coll_id.as_str()),
                        rmp_serde::to_vec(&coll)?.as_slice(),
                    )?;
                }
            }
            drop(collections);

            let mut checksums = txn.open_table(CHECKSUMS)?;
            if let Some(previous) = &previous {
                if previous.checksum != item.checksum {
                    detach_from_bucket(&mut checksums, &previous.checksum, acct_key, item_id)?;
                }
            }
            let mut bucket = load_bucket(&checksums, &item.checksum)?;
            let entry = AccountItem {
                acct_key: acct_key.to_string(),
                item_id: item_id.to_string(),
            };
            if !bucket.contains(&entry) {
                bucket.push(entry);
                checksums.insert(
                    item.checksum.as_slice(),
                    rmp_serde::to_vec(&bucket)?.as_slice(),
                )?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove the item from the index and detach it from its content-hash
    /// bucket. Deleting an item that is not stored is a no-op.
    pub fn delete_item(&self, acct_key: &str, item_id: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut items = txn.open_table(ITEMS)?;
            let removed = items
                .remove((acct_key, item_id))?
                .map(|v| v.value().to_vec());
            drop(items);
            if let Some(encoded) = removed {
                let item: DbItem = rmp_serde::from_slice(&encoded)?;
                let mut checksums = txn.open_table(CHECKSUMS)?;
                detach_from_bucket(&mut checksums, &item.checksum, acct_key, item_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_collection(&self, acct_key: &str, coll_id: &str) -> Result<Option<DbCollection>> {
        let read = self.db.begin_read()?;
        let collections = read.open_table(COLLECTIONS)?;
        let encoded = collections
            .get((acct_key, coll_id))?
            .map(|v| v.value().to_vec());
        encoded
            .as_deref()
            .map(rmp_serde::from_slice)
            .transpose()
            .map_err(Into::into)
    }

    /// Overwrite the stored collection record.
    pub fn save_collection(&self, acct_key: &str, coll_id: &str, coll: &DbCollection) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut collections = txn.open_table(COLLECTIONS)?;
            collections.insert((acct_key, coll_id), rmp_serde::to_vec(coll)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Save a collection sighted at the remote, preserving the membership
    /// set already stored for it. Item workers add to that set concurrently
    /// with the walker saving the record, so the union happens inside the
    /// transaction.
    pub fn register_collection(
        &self,
        acct_key: &str,
        coll_id: &str,
        coll: &DbCollection,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut collections = txn.open_table(COLLECTIONS)?;
            let mut record = coll.clone();
            if let Some(encoded) = collections
                .get((acct_key, coll_id))?
                .map(|v| v.value().to_vec())
            {
                let stored: DbCollection = rmp_serde::from_slice(&encoded)?;
                record.items.extend(stored.items);
            }
            collections.insert((acct_key, coll_id), rmp_serde::to_vec(&record)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete_collection(&self, acct_key: &str, coll_id: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut collections = txn.open_table(COLLECTIONS)?;
            collections.remove((acct_key, coll_id))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// IDs of every collection stored for `acct_key`.
    pub fn collection_ids(&self, acct_key: &str) -> Result<Vec<String>> {
        let read = self.db.begin_read()?;
        let collections = read.open_table(COLLECTIONS)?;
        let mut ids = Vec::new();
        for entry in collections.range((acct_key, "")..)? {
            let (key, _) = entry?;
            let (acct, coll_id) = key.value();
            if acct != acct_key {
                break;
            }
            ids.push(coll_id.to_string());
        }
        Ok(ids)
    }

    /// Add `coll_id` to the item's collection set and `item_id` to the
    /// collection's item set, in one transaction.
    pub fn attach_item_to_collection(
        &self,
        acct_key: &str,
        item_id: &str,
        coll_id: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut items = txn.open_table(ITEMS)?;
            let encoded = items
                .get((acct_key, item_id))?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| PhotarkError::MissingItem(item_id.to_string()))?;
            let mut item: DbItem = rmp_serde::from_slice(&encoded)?;
            if item.collections.insert(coll_id.to_string()) {
                items.insert((acct_key, item_id), rmp_serde::to_vec(&item)?.as_slice())?;
            }
            drop(items);

            let mut collections = txn.open_table(COLLECTIONS)?;
            let encoded = collections
                .get((acct_key, coll_id))?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| PhotarkError::MissingCollection(coll_id.to_string()))?;
            let mut coll: DbCollection = rmp_serde::from_slice(&encoded)?;
            if coll.items.insert(item_id.to_string()) {
                collections.insert((acct_key, coll_id), rmp_serde::to_vec(&coll)?.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Every item in the repository whose contents hash to `checksum`.
    pub fn items_with_checksum(&self, checksum: &[u8]) -> Result<Vec<AccountItem>> {
        let read = self.db.begin_read()?;
        let checksums = read.open_table(CHECKSUMS)?;
        let encoded = checksums.get(checksum)?.map(|v| v.value().to_vec());
        match encoded {
            Some(encoded) => rmp_serde::from_slice(&encoded).map_err(Into::into),
            None => Ok(Vec::new()),
        }
    }
}

fn load_bucket(
    checksums: &Table<'_, &[u8], &[u8]>,
    checksum: &[u8],
) -> Result<Vec<AccountItem>> {
    let encoded = checksums.get(checksum)?.map(|v| v.value().to_vec());
    match encoded {
        Some(encoded) => rmp_serde::from_slice(&encoded).map_err(Into::into),
        None => Ok(Vec::new()),
    }
}

/// Remove `(acct_key, item_id)` from the bucket for `checksum`, deleting
/// the bucket entirely when it empties.
fn detach_from_bucket(
    checksums: &mut Table<'_, &[u8], &[u8]>,
    checksum: &[u8],
    acct_key: &str,
    item_id: &str,
) -> Result<()> {
    let mut bucket = load_bucket(checksums, checksum)?;
    bucket.retain(|entry| !(entry.acct_key == acct_key && entry.item_id == item_id));
    if bucket.is_empty() {
        checksums.remove(checksum)?;
    } else {
        checksums.insert(checksum, rmp_serde::to_vec(&bucket)?.as_slice())?;
    }
    Ok(())
}

fn is_locked(err: &redb::DatabaseError) -> bool {
    match err {
        redb::DatabaseError::DatabaseAlreadyOpen => true,
        redb::DatabaseError::Storage(redb::StorageError::Io(io_err)) => {
            io_err.kind() == io::ErrorKind::WouldBlock
        }
        _ => false,
    }
}
