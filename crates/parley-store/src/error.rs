use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from the durable storage backend.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the storage directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A fetched payload did not contain the expected shape. The store is
    /// left unchanged when this is returned.
    #[error("Malformed response payload: {0}")]
    Malformed(String),

    /// JSON (de)serialization failure for persisted values.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
