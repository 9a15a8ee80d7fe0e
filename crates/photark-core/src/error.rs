use thiserror::Error;

pub type Result<T> = std::result::Result<T, PhotarkError>;

#[derive(Debug, Error)]
pub enum PhotarkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[source] Box<redb::Error>),

    #[error("index is locked by another process ({0})")]
    IndexLocked(String),

    #[error("encoding index value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decoding index value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("credentials for {account}: {reason}")]
    Credentials { account: String, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("downloading '{name}': {source}")]
    Download {
        name: String,
        #[source]
        source: Box<PhotarkError>,
    },

    #[error("no available filename for '{0}' after 999 attempts")]
    NamesExhausted(String),

    #[error("collection '{0}' not found in index")]
    MissingCollection(String),

    #[error("item '{0}' not found in index")]
    MissingItem(String),

    #[error("could not find another collection to move '{0}' to")]
    NoDestinationCollection(String),
}

impl From<redb::DatabaseError> for PhotarkError {
    fn from(value: redb::DatabaseError) -> Self {
        PhotarkError::Index(Box::new(value.into()))
    }
}

impl From<redb::TransactionError> for PhotarkError {
    fn from(value: redb::TransactionError) -> Self {
        PhotarkError::Index(Box::new(value.into()))
    }
}

impl From<redb::TableError> for PhotarkError {
    fn from(value: redb::TableError) -> Self {
        PhotarkError::Index(Box::new(value.into()))
    }
}

impl From<redb::StorageError> for PhotarkError {
    fn from(value: redb::StorageError) -> Self {
        PhotarkError::Index(Box::new(value.into()))
    }
}

impl From<redb::CommitError> for PhotarkError {
    fn from(value: redb::CommitError) -> Self {
        PhotarkError::Index(Box::new(value.into()))
    }
}
