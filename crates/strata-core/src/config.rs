//! Cache configuration
//!
//! Deserializable from the `[cache]` table of the service configuration file.
//! Every field has a default, so an empty table is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::cache::policy::DEFAULT_TTL_SECS;
use crate::error::CacheError;

/// Configuration for a tiered cache instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding the disk tier's records
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Memory tier ceiling in bytes
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: u64,
    /// Disk tier ceiling in bytes
    #[serde(default = "default_disk_max_bytes")]
    pub disk_max_bytes: u64,
    /// TTL for categories without a built-in or configured policy
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Per-category TTL overrides in seconds, keyed by category tag
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
    /// Load every live disk entry into memory at open
    #[serde(default)]
    pub warm_memory_on_open: bool,
    /// Interval of the background maintenance sweep (0 disables it)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl CacheConfig {
    /// Config rooted at `root_path` with every other setting at its default
    pub fn with_root(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.memory_max_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "memory_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.disk_max_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "disk_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl_secs == 0 {
            return Err(CacheError::InvalidConfig(
                "default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if let Some((category, _)) = self.ttl_overrides.iter().find(|(_, secs)| **secs == 0) {
            return Err(CacheError::InvalidConfig(format!(
                "TTL override for '{}' must be greater than zero",
                category
            )));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            memory_max_bytes: default_memory_max_bytes(),
            disk_max_bytes: default_disk_max_bytes(),
            default_ttl_secs: default_ttl_secs(),
            ttl_overrides: HashMap::new(),
            warm_memory_on_open: false,
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

fn default_root_path() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_memory_max_bytes() -> u64 {
    50 * 1024 * 1024 // 50 MB
}

fn default_disk_max_bytes() -> u64 {
    500 * 1024 * 1024 // 500 MB
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.memory_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.disk_max_bytes, 500 * 1024 * 1024);
        assert_eq!(config.default_ttl_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = CacheConfig::with_root("/tmp/strata");
        config.memory_max_bytes = 0;
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        let mut config = CacheConfig::default();
        config.ttl_overrides.insert("enrichment".to_string(), 0);
        assert!(config.validate().is_err());
    }
}
