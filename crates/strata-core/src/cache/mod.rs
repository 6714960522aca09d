//! Tiered cache module

mod disk;
mod entry;
mod eviction;
mod locks;
mod manager;
mod memoize;
mod memory;
pub mod policy;

#[cfg(test)]
mod testing;

pub use disk::DiskTier;
pub use entry::{CacheEntry, EntryMeta};
pub use manager::{CacheStats, TieredCache, spawn_maintenance_task};
pub use memoize::Memoized;
pub use memory::MemoryTier;
pub use policy::{Category, ExpirationPolicy};
