//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid key input: {0}")]
    InvalidKeyInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Error returned by memoized calls
///
/// Producer failures are handed back untouched; nothing is cached for them.
#[derive(Error, Debug)]
pub enum MemoizeError<E> {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Producer failed: {0}")]
    Producer(E),
}

impl<E> MemoizeError<E> {
    /// Get the producer error, if that is what failed
    pub fn into_producer(self) -> Option<E> {
        match self {
            MemoizeError::Producer(e) => Some(e),
            MemoizeError::Cache(_) => None,
        }
    }
}
