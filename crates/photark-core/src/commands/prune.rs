//! The destructive pass: make the local repository reflect remote
//! deletions. Collections that no longer exist remotely are deleted, items
//! that left a collection are detached from it, and an item's canonical
//! file is relocated (or finally unlinked) so every surviving reference
//! stays resolvable.
//!
//! Prune never downloads anything; additive reconciliation is
//! [`store`](crate::commands::store)'s job.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::thread;

use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use crate::account::AccountKey;
use crate::error::{PhotarkError, Result};
use crate::index::{DbCollection, DbItem};
use crate::provider::Item;
use crate::repo::{join_rel, AccountClient, Repository};

const ITEM_STREAM_DEPTH: usize = 64;

/// Collection id → the item ids the remote currently lists for it.
type RemoteState = HashMap<String, HashSet<String>>;

/// Remove everything the remote no longer has, for every account. A
/// credential failure or an unreadable remote skips that account; prune
/// keeps going for the others.
pub fn run(repo: &Repository) -> Result<()> {
    for account in repo.accounts() {
        let ac = match repo.client_for(&account) {
            Ok(ac) => ac,
            Err(err) => {
                error!("authorizing {account}: {err}");
                continue;
            }
        };
        let state = match remote_state(&ac) {
            Ok(state) => state,
            Err(err) => {
                error!("reading remote state for {account}: {err}");
                continue;
            }
        };
        if let Err(err) = prune_account(repo, &ac, &state) {
            error!("pruning {account}: {err}");
        }
    }
    Ok(())
}

/// Snapshot the remote: every collection id mapped to its set of item ids.
fn remote_state(ac: &AccountClient) -> Result<RemoteState> {
    let mut remote = RemoteState::new();
    for coll in ac.client.list_collections()? {
        let (item_tx, item_rx) = bounded::<Box<dyn Item>>(ITEM_STREAM_DEPTH);
        let ids = thread::scope(|s| {
            let collector = s.spawn(move || {
                let mut ids = HashSet::new();
                for item in item_rx.iter() {
                    ids.insert(item.item_id().to_string());
                }
                ids
            });
            ac.client.list_collection_items(&*coll, item_tx)?;
            collector
                .join()
                .map_err(|_| PhotarkError::Provider("item collector panicked".to_string()))
        })?;
        remote.insert(coll.collection_id().to_string(), ids);
    }
    Ok(remote)
}

fn prune_account(repo: &Repository, ac: &AccountClient, state: &RemoteState) -> Result<()> {
    let acct_key = ac.account.key();
    for coll_id in repo.index().collection_ids(&acct_key)? {
        let coll = repo
            .index()
            .load_collection(&acct_key, &coll_id)?
            .ok_or_else(|| PhotarkError::MissingCollection(coll_id.clone()))?;

        let Some(remote_items) = state.get(&coll_id) else {
            info!(
                "collection '{}' no longer exists remotely; deleting local copy",
                coll.dir_name
            );
            if let Err(err) = delete_collection(repo, &ac.account, &coll) {
                error!("deleting collection '{}': {err}", coll.dir_name);
            }
            continue;
        };

        for item_id in coll.items.clone() {
            if remote_items.contains(&item_id) {
                continue;
            }
            let item = repo
                .index()
                .load_item(&acct_key, &item_id)?
                .ok_or_else(|| PhotarkError::MissingItem(item_id.clone()))?;
            info!(
                "item '{}' is no longer in '{}'; removing local copy",
                item.file_name, coll.dir_name
            );
            delete_item_from_collection(repo, &ac.account, item, &coll)?;
        }
    }
    Ok(())
}

/// Delete a collection: detach (or fully delete) each of its items, drop
/// the record, and remove the directory, but only when nothing real is
/// left in it. Hidden files and `Thumbs.db` droppings from file managers
/// don't count.
fn delete_collection(repo: &Repository, account: &AccountKey, coll: &DbCollection) -> Result<()> {
    let acct_key = account.key();
    for item_id in coll.items.clone() {
        let item = repo
            .index()
            .load_item(&acct_key, &item_id)?
            .ok_or_else(|| PhotarkError::MissingItem(item_id.clone()))?;
        delete_item_from_collection(repo, account, item, coll)?;
    }

    repo.index().delete_collection(&acct_key, &coll.id)?;

    let full_dir = repo.full_path(&coll.dir_path);
    let entries = match fs::read_dir(&full_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let mut removable = true;
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with('.') && name != "Thumbs.db" {
            removable = false;
            break;
        }
    }
    if removable {
        fs::remove_dir_all(&full_dir)?;
    }
    Ok(())
}

/// Detach `item` from `coll`. Cascades to deleting the item entirely when
/// this was its last collection; otherwise, when the canonical file lives
/// here, it is first moved to one of the item's other collections.
fn delete_item_from_collection(
    repo: &Repository,
    account: &AccountKey,
    mut item: DbItem,
    coll: &DbCollection,
) -> Result<()> {
    if item.collections.len() == 1 {
        return delete_item(repo, account, coll, &item);
    }

    if repo.file_exists(&join_rel(&coll.dir_path, &item.file_name)) {
        // This collection has the hard copy; move it to another collection
        // that references the item and re-point everything at the new
        // path.
        let acct_key = account.key();
        let (new_path, new_name) =
            move_physical_file(repo, &acct_key, Some(coll), &item, &item, &acct_key)?;
        item.file_path = new_path;
        item.file_name = new_name;
    }

    remove_item_from_collection(repo, &account.key(), &mut item, &coll.id)
}

/// Fully delete `item`, which is (being removed) in collection `coll`.
///
/// When the canonical file lives in `coll`'s directory, the content-hash
/// bucket decides its fate: no other item has this content → unlink; some
/// other item does → that item becomes the canonical holder and the file
/// moves to one of its collections.
fn delete_item(
    repo: &Repository,
    account: &AccountKey,
    coll: &DbCollection,
    item: &DbItem,
) -> Result<()> {
    let acct_key = account.key();

    if repo.file_exists(&join_rel(&coll.dir_path, &item.file_name)) {
        let mut holders = repo.index().items_with_checksum(&item.checksum)?;
        holders.retain(|h| !(h.acct_key == acct_key && h.item_id == item.id));
        if holders.is_empty() {
            if let Err(err) = fs::remove_file(repo.full_path(&item.file_path)) {
                error!("deleting file for '{}': {err}", item.name);
            }
        } else {
            let holder = &holders[0];
            let dest = repo
                .index()
                .load_item(&holder.acct_key, &holder.item_id)?
                .ok_or_else(|| PhotarkError::MissingItem(holder.item_id.clone()))?;
            move_physical_file(repo, &acct_key, Some(coll), item, &dest, &holder.acct_key)?;
        }
    }

    // Drop every reference to the item: media list lines and membership
    // links in each collection it appears in.
    let mut working = item.clone();
    for coll_id in item.collections.clone() {
        if let Err(err) = remove_item_from_collection(repo, &acct_key, &mut working, &coll_id) {
            error!("removing '{}' from collection '{coll_id}': {err}", item.name);
        }
    }

    repo.index().delete_item(&acct_key, &item.id)
}

/// Remove `item` from the collection `coll_id`: drop its media list line,
/// then the membership links on both sides. Does not touch the file on
/// disk. The updated item record is persisted.
fn remove_item_from_collection(
    repo: &Repository,
    acct_key: &str,
    item: &mut DbItem,
    coll_id: &str,
) -> Result<()> {
    let mut coll = repo
        .index()
        .load_collection(acct_key, coll_id)?
        .ok_or_else(|| PhotarkError::MissingCollection(coll_id.to_string()))?;

    repo.replace_in_media_list(&coll.dir_path, &item.file_path, "")?;

    coll.items.remove(&item.id);
    repo.index().save_collection(acct_key, coll_id, &coll)?;
    item.collections.remove(coll_id);
    repo.index().save_item(acct_key, &item.id, item)?;
    Ok(())
}

/// The move protocol: relocate the canonical file referred to by
/// `origin.file_path` into one of `dest`'s collections (`dest` may be
/// `origin` itself). `origin_coll` is the collection the file is leaving
/// and is never chosen as the destination. Returns the new repo-relative
/// path and file name.
///
/// The `rename` in step two is the commit point; every step after it only
/// rewrites manifests and records, and a crash in between leaves stale
/// lines that later runs tolerate and converge.
fn move_physical_file(
    repo: &Repository,
    origin_acct: &str,
    origin_coll: Option<&DbCollection>,
    origin: &DbItem,
    dest: &DbItem,
    dest_acct: &str,
) -> Result<(String, String)> {
    // Choose any collection of the destination item other than the one the
    // file is leaving.
    let dest_coll_id = dest
        .collections
        .iter()
        .find(|id| origin_coll.map_or(true, |leaving| id.as_str() != leaving.id))
        .ok_or_else(|| PhotarkError::NoDestinationCollection(origin.file_path.clone()))?;
    let dest_coll = repo
        .index()
        .load_collection(dest_acct, dest_coll_id)?
        .ok_or_else(|| PhotarkError::MissingCollection(dest_coll_id.clone()))?;

    let new_name = repo.reserve_unique_filename(&dest_coll.dir_path, &dest.name, false)?;
    let new_path = join_rel(&dest_coll.dir_path, &new_name);

    fs::rename(
        repo.full_path(&origin.file_path),
        repo.full_path(&new_path),
    )?;

    // The destination referenced the item through its media list; the file
    // now lives there, so the pointer line goes.
    repo.replace_in_media_list(&dest_coll.dir_path, &origin.file_path, "")?;

    // Every other collection of the origin item gets its pointer rewritten
    // to the new location.
    for coll_id in &origin.collections {
        if coll_id == dest_coll_id {
            continue;
        }
        if origin_coll.is_some_and(|leaving| coll_id.as_str() == leaving.id) {
            continue;
        }
        let other = repo
            .index()
            .load_collection(origin_acct, coll_id)?
            .ok_or_else(|| PhotarkError::MissingCollection(coll_id.clone()))?;
        repo.replace_in_media_list(&other.dir_path, &origin.file_path, &new_path)?;
    }

    move_shared_checksum_file(repo, origin_acct, origin, &new_path, &new_name)?;

    Ok((new_path, new_name))
}

/// Re-point every other item that shares `origin`'s checksum (and every
/// media list line referencing them) at the file's new location.
fn move_shared_checksum_file(
    repo: &Repository,
    origin_acct: &str,
    origin: &DbItem,
    new_path: &str,
    new_name: &str,
) -> Result<()> {
    for holder in repo.index().items_with_checksum(&origin.checksum)? {
        if holder.acct_key == origin_acct && holder.item_id == origin.id {
            continue;
        }
        let Some(mut other) = repo.index().load_item(&holder.acct_key, &holder.item_id)? else {
            warn!(
                "checksum bucket references missing item {}:{}",
                holder.acct_key, holder.item_id
            );
            continue;
        };
        for coll_id in other.collections.clone() {
            let coll = repo
                .index()
                .load_collection(&holder.acct_key, &coll_id)?
                .ok_or_else(|| PhotarkError::MissingCollection(coll_id.clone()))?;
            repo.replace_in_media_list(&coll.dir_path, &other.file_path, new_path)?;
        }
        other.file_path = new_path.to_string();
        other.file_name = new_name.to_string();
        repo.index()
            .save_item(&holder.acct_key, &holder.item_id, &other)?;
    }
    Ok(())
}
