//! The backup pass: walk every account's remote collections, reconcile
//! each listed item against the index, and download what is new, changed,
//! or damaged.
//!
//! Shape of a run, per account: one pool of item workers drains a bounded
//! work channel; collection walkers (at most half as many, gated by a
//! semaphore) list collections, register them in the index, and stream
//! their items into the channel. Every item is processed under the
//! item-identity registry, so the same item listed by two collections is
//! handled once and the loser re-reads the committed state.

use std::cmp;
use std::collections::BTreeSet;
use std::fs;
use std::io::BufWriter;
use std::sync::{Condvar, Mutex};
use std::thread;

use chrono::Utc;
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{PhotarkError, Result};
use crate::index::{CollectionMeta, DbCollection, DbItem, ItemMeta};
use crate::provider::{Collection, Item};
use crate::repo::hashsink::HashSink;
use crate::repo::inflight::DownloadGuard;
use crate::repo::{create_dir_all_0700, create_file_0600, join_rel, AccountClient, Repository};
use crate::setting;

/// Default number of parallel item downloads.
pub const DEFAULT_WORKERS: usize = 5;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const ITEM_STREAM_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Store everything the provider returns about each collection and
    /// item, not just what the engine needs.
    pub save_everything: bool,
    /// Re-hash items that already exist in the index and re-download on
    /// mismatch.
    pub check_integrity: bool,
    /// Number of item workers (minimum 1).
    pub workers: usize,
}

impl Default for StoreRequest {
    fn default() -> Self {
        Self {
            save_everything: false,
            check_integrity: false,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// The collection an item arrived from, as the workers need it.
#[derive(Debug, Clone)]
struct CollectionCtx {
    id: String,
    name: String,
    dir_path: String,
}

/// One unit of work for the item pool.
struct WorkUnit {
    item: Box<dyn Item>,
    coll: CollectionCtx,
}

/// Download all media from all configured accounts into the repository.
///
/// Idempotent: a second run over an unchanged remote downloads nothing and
/// leaves the repository byte-identical (modulo `saved` timestamps). Never
/// destructive: items and collections that disappeared remotely are left
/// alone; that is [`prune`](crate::commands::prune)'s job.
pub fn run(repo: &Repository, req: &StoreRequest) -> Result<()> {
    let accounts = repo.authorized_accounts()?;
    for ac in &accounts {
        store_account(repo, ac, req)?;
    }
    Ok(())
}

fn store_account(repo: &Repository, ac: &AccountClient, req: &StoreRequest) -> Result<()> {
    let collections = ac.client.list_collections()?;
    info!(
        "account {}: {} remote collections",
        ac.account,
        collections.len()
    );

    let workers = cmp::max(1, req.workers);
    let walker_permits = Semaphore::new(cmp::max(1, workers.div_ceil(2)));
    let (work_tx, work_rx) = bounded::<WorkUnit>(workers * 2);

    thread::scope(|s| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            s.spawn(move || {
                for unit in work_rx.iter() {
                    if let Err(err) = process_item(repo, ac, &unit, req) {
                        error!("processing item '{}': {err}", unit.item.item_name());
                    }
                }
            });
        }
        drop(work_rx);

        for listed in collections {
            let permit = walker_permits.acquire();
            let work_tx = work_tx.clone();
            s.spawn(move || {
                let _permit = permit;
                let name = listed.collection_name().to_string();
                if let Err(err) = process_collection(repo, ac, listed, &work_tx, req) {
                    error!("processing collection '{name}': {err}");
                }
            });
        }
        drop(work_tx);
    });

    Ok(())
}

/// Register one remote collection in the index and stream its items to the
/// worker pool.
fn process_collection(
    repo: &Repository,
    ac: &AccountClient,
    listed: Box<dyn Collection>,
    work_tx: &Sender<WorkUnit>,
    req: &StoreRequest,
) -> Result<()> {
    let acct_key = ac.account.key();
    let coll_id = listed.collection_id().to_string();
    let loaded = repo.index().load_collection(&acct_key, &coll_id)?;

    // New collections get a directory name that is not in use, so two
    // remote collections with the same name never merge on disk. Known
    // collections keep the directory they already have.
    let account_path = ac.account.path();
    let dir_name = match &loaded {
        Some(stored) => stored.dir_name.clone(),
        None => repo.reserve_unique_filename(&account_path, listed.collection_name(), true)?,
    };
    let dir_path = join_rel(&account_path, &dir_name);

    let record = DbCollection {
        id: coll_id.clone(),
        name: listed.collection_name().to_string(),
        dir_name,
        dir_path: dir_path.clone(),
        saved: Utc::now(),
        items: BTreeSet::new(),
        meta: CollectionMeta {
            raw: if req.save_everything {
                listed.raw()
            } else {
                None
            },
        },
    };
    if let Err(err) = repo.index().register_collection(&acct_key, &coll_id, &record) {
        if loaded.is_none() {
            // Don't leave a stray folder for a collection we failed to
            // record.
            let _ = fs::remove_dir(repo.full_path(&dir_path));
        }
        return Err(err);
    }

    let ctx = CollectionCtx {
        id: coll_id,
        name: record.name.clone(),
        dir_path,
    };

    // The provider produces into a local channel; a forwarder wraps each
    // item with its collection context and feeds the shared work channel.
    let (item_tx, item_rx) = bounded::<Box<dyn Item>>(ITEM_STREAM_DEPTH);
    thread::scope(|s| {
        let forwarder = s.spawn({
            let work_tx = work_tx.clone();
            let ctx = ctx.clone();
            move || {
                for item in item_rx.iter() {
                    let unit = WorkUnit {
                        item,
                        coll: ctx.clone(),
                    };
                    if work_tx.send(unit).is_err() {
                        break;
                    }
                }
            }
        });
        let listing = ac.client.list_collection_items(&*listed, item_tx);
        let _ = forwarder.join();
        listing
    })
    .map_err(|err| PhotarkError::Provider(format!("listing collection items: {err}")))
}

/// Reconcile one listed item against the index, downloading as needed.
fn process_item(
    repo: &Repository,
    ac: &AccountClient,
    unit: &WorkUnit,
    req: &StoreRequest,
) -> Result<()> {
    let item = &*unit.item;
    let coll = &unit.coll;
    let acct_key = ac.account.key();

    // One worker per (provider, item id) at a time; a waiter re-reads the
    // index afterwards and typically finds the item committed.
    let guard = repo
        .inflight
        .downloads
        .acquire(&format!("{}:{}", ac.account.provider(), item.item_id()));

    match repo.index().load_item(&acct_key, item.item_id())? {
        None => {
            debug!("new item '{}' in '{}'", item.item_name(), coll.name);
            download_and_commit(repo, ac, item, coll, None, &guard, req)
        }
        Some(mut stored) => {
            // Membership first: the item may be old news but new to this
            // collection. The pointer line is only for canonical copies
            // living in some other collection's directory.
            if !stored.collections.contains(&coll.id) {
                let lives_here = stored.file_path == join_rel(&coll.dir_path, &stored.file_name);
                if !lives_here
                    && !repo.media_list_contains(&coll.dir_path, &stored.file_path)?
                {
                    repo.append_media_list(&coll.dir_path, &stored.file_path)?;
                }
                repo.index()
                    .attach_item_to_collection(&acct_key, item.item_id(), &coll.id)?;
                stored.collections.insert(coll.id.clone());
            }

            let mut stale = false;
            if req.check_integrity {
                match repo.hash_file(&stored.file_path) {
                    Ok(sum) if sum[..] == stored.checksum[..] => {}
                    Ok(_) => {
                        info!("checksum mismatch, re-downloading: {}", stored.file_path);
                        stale = true;
                    }
                    Err(err) => {
                        info!(
                            "cannot verify {} ({err}), re-downloading",
                            stored.file_path
                        );
                        stale = true;
                    }
                }
            }
            if item.item_etag() != stored.etag {
                info!("'{}' changed remotely, re-downloading", item.item_name());
                stale = true;
            }

            if stale {
                download_and_commit(repo, ac, item, coll, Some(stored), &guard, req)?;
            }
            Ok(())
        }
    }
}

/// Download an item and commit it to the index, in this order: download →
/// hash → dedup check → commit → clear temp. Either the item ends up fully
/// indexed with a matching artifact on disk, or neither exists.
fn download_and_commit(
    repo: &Repository,
    ac: &AccountClient,
    item: &dyn Item,
    coll: &CollectionCtx,
    existing: Option<DbItem>,
    guard: &DownloadGuard<'_>,
    req: &StoreRequest,
) -> Result<()> {
    let acct_key = ac.account.key();
    create_dir_all_0700(&repo.full_path(&coll.dir_path))?;

    let is_new = existing.is_none();
    let (file_name, file_path) = match &existing {
        Some(stored) => (stored.file_name.clone(), stored.file_path.clone()),
        None => {
            let name = repo.reserve_unique_filename(&coll.dir_path, item.item_name(), false)?;
            let path = join_rel(&coll.dir_path, &name);
            (name, path)
        }
    };
    guard.set_temp(repo.full_path(&file_path));

    let (checksum, prefix) = match download_with_retries(repo, ac, item, &file_path) {
        Ok(done) => done,
        Err(err) => {
            if is_new {
                // A new item leaves nothing behind; a failed re-download
                // leaves the partial file for the integrity check to
                // flag next run.
                let _ = fs::remove_file(repo.full_path(&file_path));
                guard.clear_temp();
            }
            return Err(err);
        }
    };

    let mut record = DbItem {
        id: item.item_id().to_string(),
        name: item.item_name().to_string(),
        file_name,
        file_path,
        checksum: checksum.to_vec(),
        etag: item.item_etag().to_string(),
        saved: Utc::now(),
        collections: existing
            .as_ref()
            .map(|stored| stored.collections.clone())
            .unwrap_or_default(),
        meta: ItemMeta {
            caption: item.item_caption().to_string(),
            setting: setting::setting_from_prefix(&prefix),
            raw: if req.save_everything { item.raw() } else { None },
        },
    };
    record.collections.insert(coll.id.clone());

    if is_new {
        // Content dedup: hold the content-hash key from here until the
        // commit so two fresh downloads of identical bytes cannot both
        // become canonical files.
        let _content = repo.inflight.contents.acquire(&hex::encode(checksum));
        let holders = repo.index().items_with_checksum(&checksum)?;
        if let Some(holder) = holders.first() {
            match repo.index().load_item(&holder.acct_key, &holder.item_id)? {
                Some(canonical) => {
                    debug!(
                        "content of '{}' already stored at {}; deduplicating",
                        item.item_name(),
                        canonical.file_path
                    );
                    let fresh = record.file_path.clone();
                    record.file_path = canonical.file_path;
                    record.file_name = canonical.file_name;
                    let _ = fs::remove_file(repo.full_path(&fresh));
                    guard.clear_temp();
                    let lives_here =
                        record.file_path == join_rel(&coll.dir_path, &record.file_name);
                    if !lives_here
                        && !repo.media_list_contains(&coll.dir_path, &record.file_path)?
                    {
                        repo.append_media_list(&coll.dir_path, &record.file_path)?;
                    }
                    return commit(repo, &acct_key, &record, guard, false);
                }
                None => warn!(
                    "checksum bucket references missing item {}:{}",
                    holder.acct_key, holder.item_id
                ),
            }
        }
        commit(repo, &acct_key, &record, guard, true)
    } else {
        commit(repo, &acct_key, &record, guard, true)
    }
}

/// Save the item record. When the save fails and this record owns the
/// physical file, the file is unlinked so no unindexed artifact survives.
fn commit(
    repo: &Repository,
    acct_key: &str,
    record: &DbItem,
    guard: &DownloadGuard<'_>,
    owns_file: bool,
) -> Result<()> {
    if let Err(err) = repo.index().save_item(acct_key, &record.id, record) {
        if owns_file {
            let _ = fs::remove_file(repo.full_path(&record.file_path));
        }
        guard.clear_temp();
        return Err(err);
    }
    guard.clear_temp();
    Ok(())
}

/// Create/truncate the destination and stream the item into it through the
/// hash sink, up to three attempts.
fn download_with_retries(
    repo: &Repository,
    ac: &AccountClient,
    item: &dyn Item,
    file_path: &str,
) -> Result<([u8; 32], Vec<u8>)> {
    let full = repo.full_path(file_path);
    let mut last_err = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        let file = create_file_0600(&full)?;
        let mut sink = HashSink::new(BufWriter::new(file));
        match ac.client.download(item, &mut sink) {
            Ok(()) => match sink.finish() {
                Ok(done) => return Ok(done),
                Err(err) => {
                    warn!(
                        "finishing download of '{}' (attempt {attempt}/{DOWNLOAD_ATTEMPTS}): {err}",
                        item.item_name()
                    );
                    last_err = Some(PhotarkError::from(err));
                }
            },
            Err(err) => {
                warn!(
                    "downloading '{}' (attempt {attempt}/{DOWNLOAD_ATTEMPTS}): {err}",
                    item.item_name()
                );
                last_err = Some(err);
            }
        }
    }
    Err(PhotarkError::Download {
        name: item.item_name().to_string(),
        source: Box::new(last_err.expect("at least one attempt ran")),
    })
}

// ---------------------------------------------------------------------------
// Semaphore: bounds how many collection walkers run at once
// ---------------------------------------------------------------------------

pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it. The permit is
    /// returned when the guard drops.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.freed.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphorePermit { sem: self }
    }
}

pub(crate) struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        let mut permits = self.sem.permits.lock().unwrap();
        *permits += 1;
        self.sem.freed.notify_one();
    }
}
