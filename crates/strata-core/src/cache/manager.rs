//! Tiered cache implementation

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_storage::{LocalStorage, StorageBackend};
use tracing::{debug, info};

use super::disk::DiskTier;
use super::entry::EntryMeta;
use super::locks::KeyLocks;
use super::memoize::Memoized;
use super::memory::MemoryTier;
use super::policy::{Category, ExpirationPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, MemoizeError};
use crate::key::{build_key, CacheKey};

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_size_bytes: u64,
    pub disk_size_bytes: u64,
    /// Distinct keys held by either tier
    pub entry_count: u64,
    pub memory_entry_count: u64,
    pub disk_entry_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

/// Two-level cache: a bounded memory tier in front of a persistent disk tier
///
/// Constructed explicitly with [`TieredCache::open`] and shared by reference
/// (usually `Arc<TieredCache>`); independent instances never see each
/// other's entries unless they share a root directory.
pub struct TieredCache {
    memory: MemoryTier,
    disk: DiskTier,
    policy: ExpirationPolicy,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
    hits: AtomicU64,
    misses: AtomicU64,
    config: CacheConfig,
}

impl TieredCache {
    /// Open a cache on local disk at `config.root_path`
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open a cache on local disk with a custom time source
    pub async fn open_with_clock(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let storage = Arc::new(LocalStorage::new(&config.root_path).await?);
        Self::with_storage(config, storage, clock).await
    }

    /// Open a cache over an arbitrary storage backend
    pub async fn with_storage(
        config: CacheConfig,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        info!(
            "Opening tiered cache (memory: {} bytes, disk: {} bytes, root: {:?})",
            config.memory_max_bytes, config.disk_max_bytes, config.root_path
        );

        let disk = DiskTier::open(storage, config.disk_max_bytes, clock.clone()).await?;
        let memory = MemoryTier::new(config.memory_max_bytes, clock.clone());

        if config.warm_memory_on_open {
            let entries = disk.load_all().await;
            let count = entries.len();
            for entry in entries {
                memory.set(entry.meta, entry.value);
            }
            info!(
                "Warmed memory tier with {} of {} disk entries",
                memory.len(),
                count
            );
        }

        let policy =
            ExpirationPolicy::new(config.ttl_overrides.clone(), config.default_ttl_secs);

        Ok(Self {
            memory,
            disk,
            policy,
            clock,
            locks: KeyLocks::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            config,
        })
    }

    /// Close the cache, reclaiming space held by expired disk entries
    pub async fn close(self) {
        let expired = self.disk.sweep_expired().await;
        let stats = self.stats();
        info!(
            "Closing tiered cache ({} entries, {} bytes on disk, {} expired removed, {} hits, {} misses)",
            stats.entry_count, stats.disk_size_bytes, expired, stats.hit_count, stats.miss_count
        );
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Derive the key a category and parameter set are stored under
    pub fn key_for<P>(&self, category: &Category, params: &P) -> Result<CacheKey, CacheError>
    where
        P: Serialize + ?Sized,
    {
        build_key(category, params)
    }

    /// Return the cached value, or produce, store and return it
    ///
    /// Concurrent calls for the same key run the producer at most once; the
    /// others wait and receive the stored result. A producer error is
    /// returned as `MemoizeError::Producer` and nothing is cached.
    pub async fn get_or_compute<P, F, Fut, E>(
        &self,
        category: &Category,
        params: &P,
        producer: F,
    ) -> Result<Bytes, MemoizeError<E>>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let key = build_key(category, params)?;

        if let Some(value) = self.lookup_memory(key.as_str()) {
            self.record_hit();
            return Ok(value);
        }

        let _guard = self.locks.lock(key.as_str()).await;

        // Another caller may have produced it while we waited
        if let Some(value) = self.lookup_locked(key.as_str()).await {
            self.record_hit();
            return Ok(value);
        }

        self.record_miss();
        self.produce(&key, category, producer).await
    }

    /// Re-run the producer regardless of what is cached and store the result
    pub async fn refresh<P, F, Fut, E>(
        &self,
        category: &Category,
        params: &P,
        producer: F,
    ) -> Result<Bytes, MemoizeError<E>>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let key = build_key(category, params)?;
        debug!("Refreshing {}", key);

        let _guard = self.locks.lock(key.as_str()).await;
        self.produce(&key, category, producer).await
    }

    /// Look up a value without producing it
    pub async fn get<P>(&self, category: &Category, params: &P) -> Result<Option<Bytes>, CacheError>
    where
        P: Serialize + ?Sized,
    {
        let key = build_key(category, params)?;
        let value = match self.lookup_memory(key.as_str()) {
            Some(value) => Some(value),
            None => {
                let _guard = self.locks.lock(key.as_str()).await;
                self.lookup_locked(key.as_str()).await
            }
        };
        if value.is_some() {
            self.record_hit();
        } else {
            self.record_miss();
        }
        Ok(value)
    }

    /// Store a value directly, resetting its timestamps
    pub async fn put<P>(
        &self,
        category: &Category,
        params: &P,
        value: Bytes,
    ) -> Result<CacheKey, CacheError>
    where
        P: Serialize + ?Sized,
    {
        let key = build_key(category, params)?;

        {
            let _guard = self.locks.lock(key.as_str()).await;
            self.store(&key, category, value).await;
        }

        Ok(key)
    }

    /// Drop the entry for a category and parameter set from both tiers
    pub async fn invalidate<P>(&self, category: &Category, params: &P) -> Result<bool, CacheError>
    where
        P: Serialize + ?Sized,
    {
        let key = build_key(category, params)?;
        Ok(self.invalidate_key(&key).await)
    }

    /// Drop an entry by key from both tiers
    pub async fn invalidate_key(&self, key: &CacheKey) -> bool {
        let removed = {
            let _guard = self.locks.lock(key.as_str()).await;
            let in_memory = self.memory.delete(key.as_str());
            let on_disk = self.disk.delete(key.as_str()).await;
            in_memory || on_disk
        };

        if removed {
            info!("Invalidated cache entry: {}", key);
        }
        removed
    }

    /// Remove every entry from both tiers, returning the number of keys dropped
    pub async fn clear(&self) -> usize {
        info!("Clearing all cache entries");
        let memory_keys: HashSet<String> = self.memory.keys().into_iter().collect();
        let disk_keys: HashSet<String> = self.disk.keys().into_iter().collect();
        let count = memory_keys.union(&disk_keys).count();

        self.memory.clear();
        self.disk.clear().await;

        info!("Cleared {} cache entries", count);
        count
    }

    /// Get cache statistics
    ///
    /// Entry counts cover live entries only; sizes include expired entries
    /// not yet collected, since those still occupy space.
    pub fn stats(&self) -> CacheStats {
        let memory_keys = self.memory.live_keys();
        let disk_keys: HashSet<String> = self.disk.live_keys().into_iter().collect();
        let memory_only = memory_keys
            .iter()
            .filter(|k| !disk_keys.contains(*k))
            .count();

        CacheStats {
            memory_size_bytes: self.memory.size(),
            disk_size_bytes: self.disk.size(),
            entry_count: (disk_keys.len() + memory_only) as u64,
            memory_entry_count: memory_keys.len() as u64,
            disk_entry_count: disk_keys.len() as u64,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Sweep expired entries from both tiers, then re-enforce ceilings
    ///
    /// Returns the number of expired entries removed and the bytes freed by
    /// size enforcement.
    pub async fn run_maintenance(&self) -> (u64, u64) {
        info!("Running cache maintenance");

        let expired = self.memory.sweep_expired() + self.disk.sweep_expired().await;
        let freed = self.memory.enforce_limit() + self.disk.enforce_limit().await;

        info!(
            "Maintenance complete: {} expired entries removed, {} bytes freed",
            expired, freed
        );

        (expired as u64, freed)
    }

    /// Wrap a producer function into a cache-aware callable
    pub fn memoize<F>(self: &Arc<Self>, category: Category, producer: F) -> Memoized<F> {
        Memoized::new(self.clone(), category, producer)
    }

    fn lookup_memory(&self, key: &str) -> Option<Bytes> {
        let value = self.memory.get(key)?;
        metrics::counter!("strata_cache_hits_total", "tier" => "memory").increment(1);
        Some(value)
    }

    /// Memory, then disk with promotion; the caller holds the key's lock
    async fn lookup_locked(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.lookup_memory(key) {
            return Some(value);
        }

        let entry = self.disk.get_entry(key).await?;
        metrics::counter!("strata_cache_hits_total", "tier" => "disk").increment(1);
        debug!("Promoting disk entry to memory: {}", key);
        self.memory.set(entry.meta, entry.value.clone());
        Some(entry.value)
    }

    async fn produce<F, Fut, E>(
        &self,
        key: &CacheKey,
        category: &Category,
        producer: F,
    ) -> Result<Bytes, MemoizeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        metrics::counter!("strata_cache_producer_runs_total").increment(1);
        debug!("Cache miss for {}, running producer", key);

        let value = producer().await.map_err(|e| {
            debug!("Producer for {} failed, nothing cached", key);
            MemoizeError::Producer(e)
        })?;

        self.store(key, category, value.clone()).await;
        Ok(value)
    }

    /// Write to disk first, then memory
    async fn store(&self, key: &CacheKey, category: &Category, value: Bytes) {
        let now = self.clock.now();
        let ttl = self.policy.ttl(category);
        let meta = EntryMeta::new(key.as_str(), category.clone(), value.len() as u64, now, ttl);

        if !self.disk.set(meta.clone(), value.clone()).await {
            debug!("Entry {} kept in memory only", key);
        }
        self.memory.set(meta, value);
        debug!("Cached {} (expires {})", key, now + ttl);
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("strata_cache_misses_total").increment(1);
    }
}

/// Spawn a background task that runs cache maintenance periodically
pub fn spawn_maintenance_task(
    cache: Arc<TieredCache>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    use tokio::time::interval;

    info!(
        "Starting background cache maintenance task (interval: {} seconds)",
        interval_secs
    );

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let (expired, freed) = cache.run_maintenance().await;
            if expired > 0 || freed > 0 {
                info!(
                    "Scheduled maintenance: {} expired removed, {} bytes freed",
                    expired, freed
                );
            }
            if Arc::strong_count(&cache) == 1 {
                info!("Cache dropped by all owners, stopping maintenance task");
                break;
            }
        }
    })
}
