use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No home or data directory could be resolved for this platform
    #[error("no data directory available for the local store")]
    NoDataDir,

    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema upgrade failed: {0}")]
    Migration(String),

    /// Cached conversation JSON did not round trip
    #[error("conversation cache encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored id column is not a valid UUID
    #[error("stored id: {0}")]
    Uuid(#[from] uuid::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
