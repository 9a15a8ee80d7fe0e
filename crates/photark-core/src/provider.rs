//! The seam between the engine and provider-specific clients.
//!
//! Everything HTTP/OAuth/pagination-shaped lives behind these traits; the
//! engine only ever walks collections, streams items, and downloads bytes.
//! Providers are handed to [`Repository::open`](crate::repo::Repository::open)
//! through an explicit [`Registry`] rather than any global state.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::account::AccountKey;
use crate::error::Result;

/// A client authorized to talk to one media storage service.
pub trait Client: Send + Sync {
    /// The lower-cased, one-word name of the service. It is used on the
    /// file system and as an identifier in the index, so it must be unique
    /// across registered providers.
    fn name(&self) -> &str;

    /// List every collection of media (album, bucket, stream) from which
    /// items will be downloaded.
    fn list_collections(&self) -> Result<Vec<Box<dyn Collection>>>;

    /// Stream every item in `collection` down `items`. The channel is
    /// closed by dropping the sender, which happens naturally when the
    /// implementation returns; implementations must not stash the sender.
    fn list_collection_items(
        &self,
        collection: &dyn Collection,
        items: Sender<Box<dyn Item>>,
    ) -> Result<()>;

    /// Download the item's bytes into `dest`.
    fn download(&self, item: &dyn Item, dest: &mut dyn Write) -> Result<()>;
}

/// A collection of media at the remote.
pub trait Collection: Send {
    /// Unique ID of this collection, used as an index key. Must be unique
    /// across all collections in the account.
    fn collection_id(&self) -> &str;

    /// Human-readable name. No sanitization is performed by the engine, so
    /// implementations must return something safe to use as a directory
    /// name.
    fn collection_name(&self) -> &str;

    /// Provider-encoded representation of the collection, stored in the
    /// index when `-everything` is enabled.
    fn raw(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A media item: typically a photo or a video.
pub trait Item: Send {
    /// Unique ID of the item, used as an index key and for download
    /// de-duplication. An item appearing in several collections must carry
    /// the same ID in each of them, or it will be downloaded once per
    /// collection.
    fn item_id(&self) -> &str;

    /// File name of the item, with extension. Not sanitized by the engine.
    fn item_name(&self) -> &str;

    /// Opaque remote-change token. Equal values mean the item has not
    /// changed; may be empty when the provider has no such notion.
    fn item_etag(&self) -> &str {
        ""
    }

    /// Caption or description attached to the item.
    fn item_caption(&self) -> &str {
        ""
    }

    /// Provider-encoded representation of the item, stored in the index
    /// when `-everything` is enabled.
    fn raw(&self) -> Option<Vec<u8>> {
        None
    }
}

pub type CredentialsFn = Box<dyn Fn(&str) -> Result<Vec<u8>> + Send + Sync>;
pub type NewClientFn = Box<dyn Fn(&[u8]) -> Result<Arc<dyn Client>> + Send + Sync>;

/// Description of a cloud storage provider and how to reach it.
pub struct Provider {
    /// The lower-case, one-word name of the provider.
    pub name: String,

    /// The human-readable, proper-cased name of the provider.
    pub title: String,

    /// Usernames (or account IDs) configured for this provider.
    pub accounts: Vec<String>,

    /// Obtain credentials for the given username, interactively if need
    /// be. The returned bytes are persisted in the index and later fed to
    /// `new_client`.
    pub credentials: CredentialsFn,

    /// Build an authorized client from previously obtained credentials.
    pub new_client: NewClientFn,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("accounts", &self.accounts)
            .finish_non_exhaustive()
    }
}

/// The set of providers an engine instance knows about.
///
/// Registration lowercases the provider name; iteration order is stable
/// (sorted by name) so runs are deterministic.
#[derive(Default)]
#[derive(Debug)]
pub struct Registry {
    providers: BTreeMap<String, Provider>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut provider: Provider) {
        provider.name = provider.name.to_lowercase();
        self.providers.insert(provider.name.clone(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Every configured account across every registered provider.
    pub fn accounts(&self) -> Vec<AccountKey> {
        let mut accounts = Vec::new();
        for provider in self.providers.values() {
            for username in &provider.accounts {
                accounts.push(AccountKey::new(&provider.name, username));
            }
        }
        accounts
    }
}
