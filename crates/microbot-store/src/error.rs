//! Error types for microbot-store.

use std::path::PathBuf;

/// Result type for microbot-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in microbot-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No row found for the given microbot UID.
    #[error("no microbot on record for uid {0}")]
    UnknownMicrobot(String),

    /// No row found for the given action id.
    #[error("no action on record with id {0}")]
    UnknownAction(i64),

    /// Serialization error for `action_args`.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lets `Store`'s `PairKeyStore`/`ActionStore` trait impls use `?` against
/// `microbot_core::error::Result`, the same way any other collaborator
/// crosses into the core crate's error type.
impl From<Error> for microbot_core::error::Error {
    fn from(err: Error) -> Self {
        microbot_core::error::Error::Transport(err.to_string())
    }
}
