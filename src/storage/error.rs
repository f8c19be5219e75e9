//! Storage engine error types
//!
//! Defines all errors that can occur in the persistence layer.

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Index database operation failed
    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    /// Data corruption detected (bad magic, decode failure, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Chunk file layout violation; indicates an internal bug
    #[error("Invalid chunk file: {0}")]
    InvalidChunkFile(String),
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
