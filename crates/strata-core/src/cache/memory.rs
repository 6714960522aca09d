//! In-process memory tier

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::entry::EntryMeta;
use super::eviction::{evict_until_under_limit, remove_expired, Evictable};
use crate::clock::Clock;

struct MemoryEntry {
    meta: EntryMeta,
    value: Bytes,
}

impl Evictable for MemoryEntry {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    total_size: u64,
}

/// Bounded key → value map held for the process lifetime
///
/// One lock guards both the map and the size counter. Values are `Bytes`,
/// so readers get a whole value or none at all.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
}

impl MemoryTier {
    pub fn new(max_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_bytes,
            clock,
        }
    }

    /// Look up a live value, refreshing its access time
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.meta.is_expired(now) => {
                entry.meta.last_accessed_at = now;
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        if let Some(entry) = state.entries.remove(key) {
            state.total_size = state.total_size.saturating_sub(entry.meta.size_bytes);
            debug!("Dropped expired memory entry: {}", key);
        }
        None
    }

    /// Insert or replace a value
    ///
    /// Evicts synchronously if the tier ends up over its ceiling. A value
    /// that could never fit is not admitted, but still replaces (removes)
    /// any older value under the same key.
    pub fn set(&self, mut meta: EntryMeta, value: Bytes) {
        meta.size_bytes = value.len() as u64;
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(old) = state.entries.remove(&meta.key) {
            state.total_size = state.total_size.saturating_sub(old.meta.size_bytes);
        }

        if meta.size_bytes > self.max_bytes {
            debug!(
                "Not caching {} in memory: {} bytes exceeds ceiling of {}",
                meta.key, meta.size_bytes, self.max_bytes
            );
            return;
        }

        state.total_size += meta.size_bytes;
        state
            .entries
            .insert(meta.key.clone(), MemoryEntry { meta, value });

        let MemoryState {
            entries,
            total_size,
        } = &mut *state;
        evict_until_under_limit("memory", entries, total_size, self.max_bytes, now);
    }

    /// Remove a value, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.remove(key) {
            Some(entry) => {
                state.total_size = state.total_size.saturating_sub(entry.meta.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Total bytes held
    pub fn size(&self) -> u64 {
        self.state.lock().total_size
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Keys currently held, live or not
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Keys whose entries have not yet expired
    pub fn live_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.meta.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let MemoryState {
            entries,
            total_size,
        } = &mut *state;
        remove_expired(entries, total_size, now).len()
    }

    /// Re-check the ceiling, returning the number of bytes freed
    pub fn enforce_limit(&self) -> u64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.total_size;
        let MemoryState {
            entries,
            total_size,
        } = &mut *state;
        evict_until_under_limit("memory", entries, total_size, self.max_bytes, now);
        before - state.total_size
    }

    /// Remove everything, returning the number of entries dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.total_size = 0;
        count
    }
}
