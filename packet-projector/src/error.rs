//! Error types for the projector

use thiserror::Error;

/// Result type for projector operations
pub type Result<T> = std::result::Result<T, Error>;

/// Projector errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline task gone or channel closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Entity not present in the read model
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error raised by the ledger during catch-up
    #[error("Ledger error: {0}")]
    Ledger(#[from] packet_ledger::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
