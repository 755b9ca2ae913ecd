//! Error types for the storage layer.

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family handle missing (database opened without it).
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(&'static str),

    /// Stored value has an unexpected shape.
    #[error("Corrupted value under {0}")]
    CorruptedValue(&'static str),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
