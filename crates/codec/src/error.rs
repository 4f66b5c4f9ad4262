use std::io;

use thiserror::Error;

/// Errors surfaced by the storage engine and its building blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed a checksum or could not be decoded.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The key does not exist, was deleted, or has expired.
    #[error("key not found")]
    NotFound,

    /// A bounded resource (arena, memtable queue) is exhausted.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The caller passed an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The value log segment a pointer refers to was rewritten; re-read the key.
    #[error("value log segment was rewritten, retry the read")]
    Retry,

    /// The database has been closed.
    #[error("database is closed")]
    Closed,
}

impl Error {
    /// Shorthand for building a [`Error::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
