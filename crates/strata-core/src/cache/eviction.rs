//! Size-ceiling enforcement shared by both tiers
//!
//! Victims are chosen in two passes: every expired entry goes first, then
//! live entries by ascending `last_accessed_at` (ties broken by the earliest
//! `created_at`) until the tier fits under its ceiling.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::entry::EntryMeta;

/// Anything a tier stores that carries entry metadata
pub trait Evictable {
    fn meta(&self) -> &EntryMeta;
}

impl Evictable for EntryMeta {
    fn meta(&self) -> &EntryMeta {
        self
    }
}

/// Outcome of an eviction pass
#[derive(Debug)]
pub struct Evicted<V> {
    /// Entries removed because they had expired
    pub expired: Vec<V>,
    /// Live entries removed to get under the ceiling
    pub evicted: Vec<V>,
}

impl<V> Evicted<V> {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.expired.len() + self.evicted.len()
    }

    pub fn into_all(self) -> impl Iterator<Item = V> {
        self.expired.into_iter().chain(self.evicted)
    }
}

/// Remove every expired entry, keeping `total` in step with the map
pub fn remove_expired<V: Evictable>(
    entries: &mut HashMap<String, V>,
    total: &mut u64,
    now: DateTime<Utc>,
) -> Vec<V> {
    let keys: Vec<String> = entries
        .iter()
        .filter(|(_, v)| v.meta().is_expired(now))
        .map(|(k, _)| k.clone())
        .collect();

    keys.iter()
        .filter_map(|k| entries.remove(k))
        .inspect(|v| *total = total.saturating_sub(v.meta().size_bytes))
        .collect()
}

/// Bring a tier back under `ceiling`
///
/// Does nothing when the tier already fits. Must be called with the tier's
/// lock held so the map and its size counter change together.
pub fn evict_until_under_limit<V: Evictable>(
    tier: &'static str,
    entries: &mut HashMap<String, V>,
    total: &mut u64,
    ceiling: u64,
    now: DateTime<Utc>,
) -> Evicted<V> {
    if *total <= ceiling {
        return Evicted {
            expired: Vec::new(),
            evicted: Vec::new(),
        };
    }

    let expired = remove_expired(entries, total, now);

    let mut evicted = Vec::new();
    if *total > ceiling {
        let mut order: Vec<(DateTime<Utc>, DateTime<Utc>, String)> = entries
            .iter()
            .map(|(k, v)| {
                let meta = v.meta();
                (meta.last_accessed_at, meta.created_at, k.clone())
            })
            .collect();
        order.sort();

        for (_, _, key) in order {
            if *total <= ceiling {
                break;
            }
            if let Some(victim) = entries.remove(&key) {
                debug!("Evicting {} entry: {}", tier, key);
                *total = total.saturating_sub(victim.meta().size_bytes);
                evicted.push(victim);
            }
        }
    }

    if !expired.is_empty() || !evicted.is_empty() {
        debug!(
            "{} tier eviction: {} expired, {} least recently used, now {} of {} bytes",
            tier,
            expired.len(),
            evicted.len(),
            total,
            ceiling
        );
        metrics::counter!("strata_cache_evictions_total", "tier" => tier)
            .increment((expired.len() + evicted.len()) as u64);
    }

    Evicted { expired, evicted }
}
