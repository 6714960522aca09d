//! Strata Cache Core
//!
//! This crate provides the tiered cache: key derivation, per-category
//! expiration, the memory and disk tiers with size-bounded eviction, and the
//! memoizing wrapper collaborators call into.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;

pub use cache::{
    spawn_maintenance_task, CacheEntry, CacheStats, Category, DiskTier, EntryMeta, ExpirationPolicy,
    MemoryTier, Memoized, TieredCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{CacheError, MemoizeError};
pub use key::{build_key, CacheKey};
