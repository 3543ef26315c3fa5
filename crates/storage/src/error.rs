//! Storage error types

use graphproc_core::ProcedureError;
use std::io;
use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by KV engines and the code registry
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error while reading or writing the store image
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a stored value failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted data does not have the expected shape
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Write attempted through a read-only transaction
    #[error("Transaction is read-only")]
    ReadOnly,
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for ProcedureError {
    fn from(e: StorageError) -> Self {
        ProcedureError::internal(format!("Storage error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphproc_core::ErrorKind;

    #[test]
    fn test_storage_error_is_internal() {
        let err: ProcedureError = StorageError::ReadOnly.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_io_display() {
        let err = StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("I/O error"));
    }
}
