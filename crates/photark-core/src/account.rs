use std::fmt;

/// Identity of one configured account: a provider name plus a username
/// (or email address). Both halves are stored lowercased.
///
/// Two derivations hang off this value and nothing else in the crate is
/// allowed to build them by hand: [`key`](AccountKey::key) is the index
/// namespace (`provider:username`) and [`path`](AccountKey::path) is the
/// repo-relative account directory (`provider/<sanitized username>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    provider: String,
    username: String,
}

impl AccountKey {
    pub fn new(provider: &str, username: &str) -> Self {
        Self {
            provider: provider.to_lowercase(),
            username: username.to_lowercase(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The index key for this account: `provider:username`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.username)
    }

    /// The repo-relative directory for this account. The username is made
    /// filesystem-friendly: `@` becomes `_at_` and `+` becomes `_`.
    pub fn path(&self) -> String {
        let username = self.username.replace('@', "_at_").replace('+', "_");
        format!("{}/{}", self.provider, username)
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.username)
    }
}
