pub(crate) mod hashsink;
pub(crate) mod inflight;
pub(crate) mod medialist;
pub(crate) mod names;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::account::AccountKey;
use crate::error::{PhotarkError, Result};
use crate::index::Index;
use crate::provider::{Client, Registry};

use self::inflight::Inflight;

/// Name of the index file inside the repository directory. Kept for
/// compatibility with repositories created by earlier tools.
pub const INDEX_FILE: &str = "photobak.db";

/// A repository: a directory of downloaded media plus the index that
/// describes it. The repository is the sole mutator of both; a second
/// process opening the same directory fails at the index lock.
///
/// Repository files are fully managed (every one of them is recorded in
/// the index) and should not be modified by hand.
#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    index: Index,
    registry: Registry,
    pub(crate) inflight: Inflight,
}

/// An account paired with a client authorized to access it.
pub struct AccountClient {
    pub account: AccountKey,
    pub client: Arc<dyn Client>,
}

impl Repository {
    /// Open a repository at `path`, creating the directory and the index
    /// if they do not exist, and make sure every account configured in
    /// `registry` has a home in the index.
    pub fn open(path: impl Into<PathBuf>, registry: Registry) -> Result<Self> {
        let path = path.into();
        create_dir_all_0700(&path)?;

        let index = Index::open(&path.join(INDEX_FILE))?;
        for account in registry.accounts() {
            index.create_account(&account.key())?;
        }

        Ok(Self {
            path,
            index,
            registry,
            inflight: Inflight::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Convert a repo-relative path to a real filesystem path. Stored
    /// paths (index fields, media list lines) are always repo-relative;
    /// the conversion happens only at filesystem touchpoints.
    pub fn full_path(&self, repo_relative: &str) -> PathBuf {
        self.path.join(repo_relative)
    }

    pub(crate) fn file_exists(&self, repo_relative: &str) -> bool {
        self.full_path(repo_relative).exists()
    }

    /// SHA-256 of the file at the repo-relative `path`.
    pub(crate) fn hash_file(&self, repo_relative: &str) -> Result<[u8; 32]> {
        let mut file = File::open(self.full_path(repo_relative))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// Every account configured across the registered providers.
    pub fn accounts(&self) -> Vec<AccountKey> {
        self.registry.accounts()
    }

    /// Credentials for `account`: loaded from the index when present,
    /// otherwise obtained from the provider and persisted.
    fn obtain_credentials(&self, account: &AccountKey) -> Result<Vec<u8>> {
        if let Some(creds) = self.index.load_credentials(&account.key())? {
            return Ok(creds);
        }
        let provider = self.registry.get(account.provider()).ok_or_else(|| {
            PhotarkError::Credentials {
                account: account.to_string(),
                reason: "provider is not registered".to_string(),
            }
        })?;
        let creds =
            (provider.credentials)(account.username()).map_err(|err| PhotarkError::Credentials {
                account: account.to_string(),
                reason: err.to_string(),
            })?;
        self.index.save_credentials(&account.key(), &creds)?;
        Ok(creds)
    }

    /// An authorized client for `account`.
    pub fn client_for(&self, account: &AccountKey) -> Result<AccountClient> {
        let creds = self.obtain_credentials(account)?;
        let provider = self.registry.get(account.provider()).ok_or_else(|| {
            PhotarkError::Credentials {
                account: account.to_string(),
                reason: "provider is not registered".to_string(),
            }
        })?;
        let client =
            (provider.new_client)(&creds).map_err(|err| PhotarkError::Credentials {
                account: account.to_string(),
                reason: format!("creating authorized client: {err}"),
            })?;
        Ok(AccountClient {
            account: account.clone(),
            client,
        })
    }

    /// Authorized clients for every configured account. Any credential
    /// failure aborts; a backup run must not silently skip an account.
    pub fn authorized_accounts(&self) -> Result<Vec<AccountClient>> {
        self.accounts()
            .iter()
            .map(|account| self.client_for(account))
            .collect()
    }

    /// Obtain and persist credentials for every configured account without
    /// performing any backups, so the repository can then run headless.
    pub fn authorize_all_accounts(&self) -> Result<()> {
        for account in self.accounts() {
            self.obtain_credentials(&account)?;
            info!("account {account} is authorized");
        }
        Ok(())
    }

    /// Close the repository cleanly. The index is transaction-durable, so
    /// this only releases the handle (and with it the file lock).
    pub fn close(self) {
        drop(self);
    }

    /// Interrupt-time teardown: unlink every partially downloaded file
    /// currently in flight, best-effort, so a killed run leaves no
    /// unindexed artifacts behind. The caller is expected to exit shortly
    /// after; the index needs no explicit flushing.
    pub fn close_unsafe(&self) {
        self.inflight.downloads.remove_partial_files();
    }
}

/// Join a repo-relative directory and a name with a forward slash, the
/// separator used in every stored path.
pub(crate) fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

pub(crate) fn create_dir_all_0700(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

pub(crate) fn create_file_0600(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

pub(crate) fn open_append_0600(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
