//! Cache entry metadata and the on-disk record format

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strata_storage::backend::compute_sha256;
use strata_storage::StorageError;

use super::policy::Category;

const RECORD_VERSION: u32 = 1;

/// Bookkeeping for one cached value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl EntryMeta {
    /// Metadata for a value written now with the given TTL
    pub fn new(
        key: impl Into<String>,
        category: Category,
        size_bytes: u64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            category,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_accessed_at: now,
            size_bytes,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A cached value together with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub value: Bytes,
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    version: u32,
    #[serde(flatten)]
    meta: EntryMeta,
    checksum: String,
}

/// Encode an entry as a single-line JSON header, a newline, then the payload
pub(crate) fn encode_record(meta: &EntryMeta, value: &[u8]) -> Result<Bytes, StorageError> {
    let header = RecordHeader {
        version: RECORD_VERSION,
        meta: meta.clone(),
        checksum: compute_sha256(value),
    };
    // Compact JSON escapes control characters, so the header has no raw newline
    let header = serde_json::to_vec(&header).map_err(|e| StorageError::Corrupt {
        name: meta.key.clone(),
        reason: format!("unencodable header: {}", e),
    })?;

    let mut buf = BytesMut::with_capacity(header.len() + 1 + value.len());
    buf.put_slice(&header);
    buf.put_u8(b'\n');
    buf.put_slice(value);
    Ok(buf.freeze())
}

/// Decode and verify a record
pub(crate) fn decode_record(name: &str, data: Bytes) -> Result<CacheEntry, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        name: name.to_string(),
        reason,
    };

    let split = data
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| corrupt("missing header terminator".to_string()))?;

    let header: RecordHeader = serde_json::from_slice(&data[..split])
        .map_err(|e| corrupt(format!("unreadable header: {}", e)))?;

    if header.version != RECORD_VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }

    let value = data.slice(split + 1..);
    if value.len() as u64 != header.meta.size_bytes {
        return Err(corrupt(format!(
            "size mismatch: header says {}, payload has {}",
            header.meta.size_bytes,
            value.len()
        )));
    }

    let checksum = compute_sha256(&value);
    if checksum != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: expected {}, got {}",
            header.checksum, checksum
        )));
    }

    Ok(CacheEntry {
        meta: header.meta,
        value,
    })
}
