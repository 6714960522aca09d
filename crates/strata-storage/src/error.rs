//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record name: {0}")]
    InvalidName(String),

    #[error("Corrupt record {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

impl StorageError {
    /// Map an IO error, turning `NotFound` into the record-level variant
    pub(crate) fn from_io(name: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(name.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}
