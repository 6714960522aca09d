//! Storage backend trait

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Length of a record name: a hex-encoded SHA-256 digest
pub const RECORD_NAME_LEN: usize = 64;

/// Storage backend trait
///
/// Implementations hold one individually addressable record per cache key.
/// A `write` must be atomic with respect to that record: after a crash the
/// record either holds its previous complete contents or the new ones.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check if a record exists
    async fn exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Read a record fully into memory
    async fn read(&self, name: &str) -> Result<Bytes, StorageError>;

    /// Atomically replace a record
    async fn write(&self, name: &str, data: Bytes) -> Result<(), StorageError>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// List the names of all stored records
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Get the storage path for a record (for logging)
    fn storage_path(&self, name: &str) -> String;
}

/// Derive the record name for an arbitrary cache key
pub fn record_name(key: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Compute SHA256 checksum of data
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("sha256:{}", hex::encode(result))
}

/// Validate a record name
///
/// Names are used as file names, so anything other than lowercase hex of the
/// expected length is rejected to prevent path traversal.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.len() != RECORD_NAME_LEN {
        return Err(StorageError::InvalidName(format!(
            "expected {} characters, got {}: {}",
            RECORD_NAME_LEN,
            name.len(),
            name
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(StorageError::InvalidName(format!(
            "non-hex characters in name: {}",
            name
        )));
    }
    Ok(())
}
