//! Error types for memvault

use thiserror::Error;

/// Result type alias for memvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in memvault
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unrecoverable failure while opening or initializing a tenant store.
    /// The one process-fatal condition in the core.
    #[error("Store initialization failed: {0}")]
    StoreInit(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn store_init(msg: impl Into<String>) -> Self {
        Self::StoreInit(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error is a synchronous validation rejection
    /// (never retried, surfaced to the caller as-is).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
