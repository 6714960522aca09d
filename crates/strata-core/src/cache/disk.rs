//! Persistent disk tier

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_storage::backend::record_name;
use strata_storage::{StorageBackend, StorageError};
use tracing::{debug, info, warn};

use super::entry::{decode_record, encode_record, CacheEntry, EntryMeta};
use super::eviction::{evict_until_under_limit, remove_expired};
use super::locks::KeyLocks;
use crate::clock::Clock;
use crate::error::CacheError;

#[derive(Default)]
struct DiskIndex {
    entries: HashMap<String, EntryMeta>,
    total_size: u64,
}

impl DiskIndex {
    fn insert(&mut self, meta: EntryMeta) {
        if let Some(old) = self.entries.remove(&meta.key) {
            self.total_size = self.total_size.saturating_sub(old.size_bytes);
        }
        self.total_size += meta.size_bytes;
        self.entries.insert(meta.key.clone(), meta);
    }

    fn remove(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(meta.size_bytes);
        Some(meta)
    }

    /// Remove only if the indexed entry is still the generation we looked at
    fn remove_if_created(&mut self, key: &str, created_at: DateTime<Utc>) -> bool {
        let matches = self
            .entries
            .get(key)
            .is_some_and(|m| m.created_at == created_at);
        if matches {
            self.remove(key);
        }
        matches
    }
}

/// Persistent key → value map with its own size ceiling
///
/// Every entry is one record in the storage backend. An in-memory index of
/// entry metadata is rebuilt from the records at open and drives expiry,
/// size accounting and eviction. The index lock is never held across I/O.
/// Writing a key's record and deleting it are serialized per key, and a
/// delete only goes ahead if the index holds no newer generation.
///
/// Read failures are misses; write failures are retried once and then
/// swallowed. Neither ever reaches the caller.
pub struct DiskTier {
    storage: Arc<dyn StorageBackend>,
    index: Mutex<DiskIndex>,
    locks: KeyLocks,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
}

impl DiskTier {
    /// Open the tier, indexing every live record in `storage`
    ///
    /// Expired and unreadable records found along the way are deleted.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let tier = Self {
            storage,
            index: Mutex::new(DiskIndex::default()),
            locks: KeyLocks::default(),
            max_bytes,
            clock,
        };

        let names = tier.storage.list().await?;
        let now = tier.clock.now();
        let mut dropped = 0usize;

        for name in names {
            match tier.read_record(&name).await {
                Some(entry) if !entry.meta.is_expired(now) => {
                    tier.index.lock().insert(entry.meta);
                }
                _ => {
                    dropped += 1;
                    tier.delete_record(&name).await;
                }
            }
        }

        let freed = tier.enforce_limit().await;
        let (count, size) = {
            let index = tier.index.lock();
            (index.entries.len(), index.total_size)
        };
        info!(
            "Disk tier indexed {} entries ({} bytes, ceiling {}), dropped {} stale records, freed {} bytes",
            count, size, tier.max_bytes, dropped, freed
        );

        Ok(tier)
    }

    /// Read every live entry, for warming the memory tier
    pub async fn load_all(&self) -> Vec<CacheEntry> {
        let keys = self.keys();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get_entry(&key).await {
                entries.push(entry);
            }
        }
        entries
    }

    /// Look up a live value
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Look up a live entry with its metadata, refreshing its access time
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let indexed = self.index.lock().entries.get(key).cloned()?;
        let name = record_name(key);

        if indexed.is_expired(now) {
            debug!("Disk entry expired: {}", key);
            let removed = self.index.lock().remove_if_created(key, indexed.created_at);
            if removed {
                self.delete_unless_indexed(key).await;
            }
            return None;
        }

        let entry = match self.storage.read(&name).await {
            Ok(data) => match decode_record(&name, data) {
                Ok(entry) if entry.meta.key == key => entry,
                Ok(entry) => {
                    warn!(
                        "Record {} holds key {} instead of {}",
                        name, entry.meta.key, key
                    );
                    self.forget(key, indexed.created_at).await;
                    return None;
                }
                Err(e) => {
                    warn!("Dropping unreadable disk entry {}: {}", key, e);
                    self.forget(key, indexed.created_at).await;
                    return None;
                }
            },
            Err(StorageError::NotFound(_)) => {
                warn!("Disk entry indexed but missing from storage: {}", key);
                self.index.lock().remove_if_created(key, indexed.created_at);
                return None;
            }
            Err(e) => {
                warn!("Failed to read disk entry {}: {}", key, e);
                return None;
            }
        };

        if entry.meta.is_expired(now) {
            return None;
        }

        // The key may have been rewritten or removed while we were reading
        let mut meta = entry.meta;
        {
            let mut index = self.index.lock();
            match index.entries.get_mut(key) {
                Some(current) if current.created_at == indexed.created_at => {
                    current.last_accessed_at = now;
                    meta.last_accessed_at = now;
                }
                _ => {
                    debug!("Disk entry {} changed during read, treating as miss", key);
                    return None;
                }
            }
        }

        Some(CacheEntry {
            meta,
            value: entry.value,
        })
    }

    /// Persist a value, then evict if the tier is over its ceiling
    ///
    /// Returns whether the value was stored. A failed write is retried once;
    /// if it still fails, any older record for the key is dropped so a stale
    /// value cannot resurface.
    pub async fn set(&self, mut meta: EntryMeta, value: Bytes) -> bool {
        meta.size_bytes = value.len() as u64;
        let key = meta.key.clone();
        let guard = self.locks.lock(&key).await;

        if meta.size_bytes > self.max_bytes {
            debug!(
                "Not caching {} on disk: {} bytes exceeds ceiling of {}",
                key, meta.size_bytes, self.max_bytes
            );
            self.remove_locked(&key).await;
            return false;
        }

        let record = match encode_record(&meta, &value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to encode disk entry {}: {}", key, e);
                self.remove_locked(&key).await;
                return false;
            }
        };

        let name = record_name(&key);
        if let Err(e) = self.storage.write(&name, record.clone()).await {
            warn!("Write of disk entry {} failed, retrying: {}", key, e);
            if let Err(e) = self.storage.write(&name, record).await {
                warn!("Giving up on disk entry {}: {}", key, e);
                self.remove_locked(&key).await;
                return false;
            }
        }

        let now = self.clock.now();
        let victims = {
            let mut index = self.index.lock();
            index.insert(meta);
            let DiskIndex {
                entries,
                total_size,
            } = &mut *index;
            evict_until_under_limit("disk", entries, total_size, self.max_bytes, now)
        };
        drop(guard);

        for victim in victims.into_all() {
            self.delete_unless_indexed(&victim.key).await;
        }
        true
    }

    /// Remove a value, returning whether anything was removed
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.locks.lock(key).await;
        self.remove_locked(key).await
    }

    /// Total bytes held
    pub fn size(&self) -> u64 {
        self.index.lock().total_size
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.lock().entries.keys().cloned().collect()
    }

    /// Keys whose entries have not yet expired
    pub fn live_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.index
            .lock()
            .entries
            .values()
            .filter(|meta| !meta.is_expired(now))
            .map(|meta| meta.key.clone())
            .collect()
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired = {
            let mut index = self.index.lock();
            let DiskIndex {
                entries,
                total_size,
            } = &mut *index;
            remove_expired(entries, total_size, now)
        };

        for meta in &expired {
            self.delete_unless_indexed(&meta.key).await;
        }
        expired.len()
    }

    /// Re-check the ceiling, returning the number of bytes freed
    pub async fn enforce_limit(&self) -> u64 {
        let now = self.clock.now();
        let (victims, freed) = {
            let mut index = self.index.lock();
            let before = index.total_size;
            let DiskIndex {
                entries,
                total_size,
            } = &mut *index;
            let victims =
                evict_until_under_limit("disk", entries, total_size, self.max_bytes, now);
            (victims, before - index.total_size)
        };

        for victim in victims.into_all() {
            self.delete_unless_indexed(&victim.key).await;
        }
        freed
    }

    /// Remove everything, returning the number of entries dropped
    pub async fn clear(&self) -> usize {
        let entries = std::mem::take(&mut *self.index.lock());
        let count = entries.entries.len();
        for key in entries.entries.keys() {
            self.delete_unless_indexed(key).await;
        }
        count
    }

    async fn read_record(&self, name: &str) -> Option<CacheEntry> {
        let data = match self.storage.read(name).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read record {}: {}", name, e);
                return None;
            }
        };
        match decode_record(name, data) {
            Ok(entry) if record_name(&entry.meta.key) == name => Some(entry),
            Ok(entry) => {
                warn!("Record {} is filed under the wrong name for {}", name, entry.meta.key);
                None
            }
            Err(e) => {
                warn!("Skipping record: {}", e);
                None
            }
        }
    }

    async fn forget(&self, key: &str, created_at: DateTime<Utc>) {
        let removed = self.index.lock().remove_if_created(key, created_at);
        if removed {
            self.delete_unless_indexed(key).await;
        }
    }

    /// Drop a key from the index and storage; the caller holds its lock
    async fn remove_locked(&self, key: &str) -> bool {
        let indexed = self.index.lock().remove(key).is_some();
        let removed = self.delete_record(&record_name(key)).await;
        indexed || removed
    }

    /// Delete the record of an entry already dropped from the index
    ///
    /// Skipped when a concurrent `set` has indexed a newer generation, since
    /// the file on disk is then that generation's.
    async fn delete_unless_indexed(&self, key: &str) -> bool {
        let _guard = self.locks.lock(key).await;
        let rewritten = self.index.lock().entries.contains_key(key);
        if rewritten {
            debug!("Record for {} was rewritten, keeping it", key);
            return false;
        }
        self.delete_record(&record_name(key)).await
    }

    async fn delete_record(&self, name: &str) -> bool {
        match self.storage.delete(name).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(
                    "Failed to delete record {}: {}",
                    self.storage.storage_path(name),
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::Category;
    use crate::cache::testing::PausingStorage;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_storage::LocalStorage;
    use tempfile::TempDir;

    async fn setup(max_bytes: u64) -> (DiskTier, Arc<ManualClock>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let tier = DiskTier::open(storage, max_bytes, clock.clone()).await.unwrap();
        (tier, clock, dir)
    }

    fn meta(clock: &ManualClock, key: &str, ttl: Duration) -> EntryMeta {
        EntryMeta::new(key, Category::Enrichment, 0, clock.now(), ttl)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (tier, clock, _dir) = setup(1024).await;
        assert!(tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"value")).await);

        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"value")));
        assert_eq!(tier.size(), 5);
        assert!(tier.delete("k").await);
        assert_eq!(tier.get("k").await, None);
        assert_eq!(tier.size(), 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        {
            let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
            let tier = DiskTier::open(storage, 1024, clock.clone()).await.unwrap();
            tier.set(meta(&clock, "a", Duration::hours(1)), Bytes::from_static(b"alpha")).await;
            tier.set(meta(&clock, "b", Duration::seconds(5)), Bytes::from_static(b"beta")).await;
        }
        clock.advance(Duration::seconds(10));

        let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let tier = DiskTier::open(storage.clone(), 1024, clock.clone()).await.unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 5);
        assert_eq!(tier.get("a").await, Some(Bytes::from_static(b"alpha")));
        // Expired record was removed from storage during open
        assert_eq!(storage.list().await.unwrap().len(), 1);

        let loaded = tier.load_all().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.key, "a");
        assert_eq!(loaded[0].meta.category, Category::Enrichment);
    }

    #[tokio::test]
    async fn test_expired_get_deletes_record() {
        let (tier, clock, dir) = setup(1024).await;
        tier.set(meta(&clock, "k", Duration::seconds(30)), Bytes::from_static(b"v")).await;

        clock.advance(Duration::seconds(29));
        assert!(tier.get("k").await.is_some());

        clock.advance(Duration::seconds(2));
        assert!(tier.get("k").await.is_none());
        assert_eq!(tier.size(), 0);

        let storage = LocalStorage::new(dir.path()).await.unwrap();
        assert!(!storage.exists(&record_name("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_miss_and_removed() {
        let (tier, clock, dir) = setup(1024).await;
        tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"payload")).await;

        let storage = LocalStorage::new(dir.path()).await.unwrap();
        let path = storage.storage_path(&record_name("k"));
        std::fs::write(&path, b"{\"version\":1}\ngarbage").unwrap();

        assert!(tier.get("k").await.is_none());
        assert!(!tier.contains("k"));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_size_bound_and_lru() {
        let (tier, clock, _dir) = setup(30).await;
        for key in ["a", "b", "c"] {
            tier.set(meta(&clock, key, Duration::hours(1)), Bytes::from(vec![1u8; 10])).await;
            clock.advance(Duration::seconds(1));
        }
        assert!(tier.get("a").await.is_some());
        clock.advance(Duration::seconds(1));

        tier.set(meta(&clock, "d", Duration::hours(1)), Bytes::from(vec![1u8; 10])).await;
        assert!(tier.size() <= 30);
        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_lowered_ceiling_enforced_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        {
            let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
            let tier = DiskTier::open(storage, 1024, clock.clone()).await.unwrap();
            for i in 0..5 {
                tier.set(meta(&clock, &format!("k{}", i), Duration::hours(1)), Bytes::from(vec![0u8; 10]))
                    .await;
                clock.advance(Duration::seconds(1));
            }
        }

        let storage = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let tier = DiskTier::open(storage.clone(), 25, clock.clone()).await.unwrap();
        assert_eq!(tier.size(), 20);
        assert_eq!(storage.list().await.unwrap().len(), 2);
        assert!(tier.contains("k3"));
        assert!(tier.contains("k4"));
    }

    /// Backend whose first `failures` writes fail
    struct FlakyStorage {
        inner: LocalStorage,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for FlakyStorage {
        async fn exists(&self, name: &str) -> Result<bool, StorageError> {
            self.inner.exists(name).await
        }

        async fn read(&self, name: &str) -> Result<Bytes, StorageError> {
            self.inner.read(name).await
        }

        async fn write(&self, name: &str, data: Bytes) -> Result<(), StorageError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.write(name, data).await
        }

        async fn delete(&self, name: &str) -> Result<bool, StorageError> {
            self.inner.delete(name).await
        }

        async fn list(&self) -> Result<Vec<String>, StorageError> {
            self.inner.list().await
        }

        fn storage_path(&self, name: &str) -> String {
            self.inner.storage_path(name)
        }
    }

    async fn flaky(failures: usize) -> (DiskTier, Arc<FlakyStorage>, Arc<ManualClock>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(FlakyStorage {
            inner: LocalStorage::new(dir.path()).await.unwrap(),
            failures,
            attempts: AtomicUsize::new(0),
        });
        let tier = DiskTier::open(storage.clone(), 1024, clock.clone()).await.unwrap();
        (tier, storage, clock, dir)
    }

    #[tokio::test]
    async fn test_write_retried_once() {
        let (tier, storage, clock, _dir) = flaky(1).await;
        assert!(tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"v")).await);
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_write_failure_swallowed() {
        let (tier, storage, clock, _dir) = flaky(2).await;
        assert!(!tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"v")).await);
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(tier.get("k").await, None);
        assert_eq!(tier.size(), 0);
    }

    async fn pausing() -> (Arc<DiskTier>, Arc<PausingStorage>, Arc<ManualClock>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(PausingStorage::new(LocalStorage::new(dir.path()).await.unwrap()));
        let tier = DiskTier::open(storage.clone(), 1024, clock.clone()).await.unwrap();
        (Arc::new(tier), storage, clock, dir)
    }

    #[tokio::test]
    async fn test_rewrite_during_read_is_miss() {
        let (tier, storage, clock, _dir) = pausing().await;
        tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"v1")).await;

        storage.pause_next_read();
        let reader = {
            let tier = tier.clone();
            tokio::spawn(async move { tier.get_entry("k").await })
        };
        storage.wait_paused().await;

        clock.advance(Duration::seconds(1));
        assert!(tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"v2")).await);
        storage.resume();

        assert!(reader.await.unwrap().is_none());
        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"v2")));
    }

    #[tokio::test]
    async fn test_delete_during_read_is_miss() {
        let (tier, storage, clock, _dir) = pausing().await;
        tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"v1")).await;

        storage.pause_next_read();
        let reader = {
            let tier = tier.clone();
            tokio::spawn(async move { tier.get_entry("k").await })
        };
        storage.wait_paused().await;

        assert!(tier.delete("k").await);
        storage.resume();

        assert!(reader.await.unwrap().is_none());
        assert!(!tier.contains("k"));
    }

    #[tokio::test]
    async fn test_victim_delete_spares_rewritten_record() {
        let (tier, clock, dir) = setup(1024).await;
        tier.set(meta(&clock, "k", Duration::hours(1)), Bytes::from_static(b"fresh")).await;

        // Still indexed: a newer generation owns the file
        assert!(!tier.delete_unless_indexed("k").await);
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        assert!(storage.exists(&record_name("k")).await.unwrap());
        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"fresh")));

        tier.index.lock().remove("k");
        assert!(tier.delete_unless_indexed("k").await);
        assert!(!storage.exists(&record_name("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_live_keys_skip_expired() {
        let (tier, clock, _dir) = setup(1024).await;
        tier.set(meta(&clock, "short", Duration::seconds(5)), Bytes::from_static(b"a")).await;
        tier.set(meta(&clock, "long", Duration::hours(1)), Bytes::from_static(b"b")).await;
        clock.advance(Duration::seconds(6));

        assert_eq!(tier.live_keys(), vec!["long".to_string()]);
        assert_eq!(tier.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_and_clear() {
        let (tier, clock, _dir) = setup(1024).await;
        tier.set(meta(&clock, "short", Duration::seconds(5)), Bytes::from_static(b"a")).await;
        tier.set(meta(&clock, "long", Duration::hours(1)), Bytes::from_static(b"b")).await;
        clock.advance(Duration::seconds(6));

        assert_eq!(tier.sweep_expired().await, 1);
        assert_eq!(tier.keys(), vec!["long".to_string()]);
        assert_eq!(tier.clear().await, 1);
        assert!(tier.is_empty());
        assert_eq!(tier.size(), 0);
    }
}
