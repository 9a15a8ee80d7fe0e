//! In-flight coordination registries.
//!
//! Three keyed maps serialize the work that must never run twice at once:
//! filename reservation (keyed by `dir/target-name`), item processing
//! (keyed by `provider:item-id`), and content-hash dedup decisions (keyed
//! by the hex checksum). Each entry carries a completion signal; acquirers
//! that find the key taken wait on the signal *without* holding the map
//! lock, then re-check. The previous holder's work usually changes what
//! the newcomer should do, so waiters always re-enter from scratch.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

/// A one-shot broadcast flag: waiters block until `set` is called once.
struct Signal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    fn set(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cv.notify_all();
    }
}

/// A mutual-exclusion map from string keys to completion signals.
#[derive(Default)]
pub(crate) struct SignalMap {
    inner: Mutex<HashMap<String, Arc<Signal>>>,
}

impl std::fmt::Debug for SignalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalMap").finish_non_exhaustive()
    }
}

impl SignalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `key`, waiting for the current holder first if
    /// there is one. The key is released (and all waiters woken) when the
    /// returned guard drops.
    pub fn acquire(&self, key: &str) -> SignalGuard<'_> {
        loop {
            let occupied = {
                let mut map = self.inner.lock().unwrap();
                match map.entry(key.to_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(Signal::new()));
                        return SignalGuard {
                            map: self,
                            key: key.to_string(),
                        };
                    }
                    Entry::Occupied(slot) => Arc::clone(slot.get()),
                }
            };
            occupied.wait();
        }
    }
}

pub(crate) struct SignalGuard<'a> {
    map: &'a SignalMap,
    key: String,
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.inner.lock().unwrap();
        if let Some(signal) = map.remove(&self.key) {
            signal.set();
        }
    }
}

/// State shared between an item download in progress and anyone waiting on
/// it. `temp` holds the path of the partially written file so an interrupt
/// can unlink it.
struct DownloadSlot {
    signal: Signal,
    temp: Mutex<Option<PathBuf>>,
}

/// The item-identity registry: at most one worker processes a given
/// `provider:item-id` at a time, and the registry knows which partial file
/// each in-progress download is writing.
#[derive(Default)]
pub(crate) struct DownloadMap {
    inner: Mutex<HashMap<String, Arc<DownloadSlot>>>,
}

impl std::fmt::Debug for DownloadMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadMap").finish_non_exhaustive()
    }
}

impl DownloadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> DownloadGuard<'_> {
        loop {
            let occupied = {
                let mut map = self.inner.lock().unwrap();
                match map.entry(key.to_string()) {
                    Entry::Vacant(entry) => {
                        let slot = Arc::new(DownloadSlot {
                            signal: Signal::new(),
                            temp: Mutex::new(None),
                        });
                        entry.insert(Arc::clone(&slot));
                        return DownloadGuard {
                            map: self,
                            key: key.to_string(),
                            slot,
                        };
                    }
                    Entry::Occupied(entry) => Arc::clone(entry.get()),
                }
            };
            debug!("item '{key}' is already being processed; waiting");
            occupied.signal.wait();
        }
    }

    /// Best-effort removal of every partially written file currently in
    /// flight. Called on interrupt, before the process exits.
    pub fn remove_partial_files(&self) {
        let slots: Vec<Arc<DownloadSlot>> = {
            let map = self.inner.lock().unwrap();
            map.values().map(Arc::clone).collect()
        };
        for slot in slots {
            let path = slot.temp.lock().unwrap().take();
            if let Some(path) = path {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("removing partial download {}: {err}", path.display());
                }
            }
        }
    }
}

pub(crate) struct DownloadGuard<'a> {
    map: &'a DownloadMap,
    key: String,
    slot: Arc<DownloadSlot>,
}

impl DownloadGuard<'_> {
    /// Record the file this download is writing so interrupt-time cleanup
    /// can unlink it.
    pub fn set_temp(&self, path: PathBuf) {
        *self.slot.temp.lock().unwrap() = Some(path);
    }

    /// Clear the recorded path once the item is committed; the file is no
    /// longer temporary.
    pub fn clear_temp(&self) {
        *self.slot.temp.lock().unwrap() = None;
    }
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.inner.lock().unwrap();
        if let Some(slot) = map.remove(&self.key) {
            slot.signal.set();
        }
    }
}

/// The three registries, owned by the repository.
#[derive(Default)]
#[derive(Debug)]
pub(crate) struct Inflight {
    /// Filename reservations, keyed by `dir/target-name`.
    pub names: SignalMap,
    /// Item downloads, keyed by `provider:item-id`.
    pub downloads: DownloadMap,
    /// Content dedup decisions, keyed by hex checksum.
    pub contents: SignalMap,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }
}
