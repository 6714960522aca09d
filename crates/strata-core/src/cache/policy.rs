//! Per-category expiration policies

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// TTL applied to categories the table does not know about
pub const DEFAULT_TTL_SECS: u64 = 3600;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Upper bound on any TTL, keeps `created_at + ttl` representable
const MAX_TTL_SECS: u64 = 100 * 365 * DAY;

/// Kind of cached value, selecting its expiration policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    /// Generated legal documents
    GeneratedAct,
    /// Analysis of a user query
    QueryAnalysis,
    /// External enrichment lookups (company registries and the like)
    Enrichment,
    /// Case-law reference lookups
    Jurisprudence,
    /// Document templates
    Template,
    /// Any other tag; expires after the fail-closed default TTL
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::GeneratedAct => "generated_act",
            Category::QueryAnalysis => "query_analysis",
            Category::Enrichment => "enrichment",
            Category::Jurisprudence => "jurisprudence",
            Category::Template => "template",
            Category::Other(tag) => tag,
        }
    }

    /// Built-in TTL in seconds, if the category is a known one
    pub fn builtin_ttl_secs(&self) -> Option<u64> {
        match self {
            Category::GeneratedAct => Some(DAY),
            Category::QueryAnalysis => Some(HOUR),
            Category::Enrichment => Some(7 * DAY),
            Category::Jurisprudence => Some(30 * DAY),
            Category::Template => Some(90 * DAY),
            Category::Other(_) => None,
        }
    }
}

impl FromStr for Category {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "generated_act" => Category::GeneratedAct,
            "query_analysis" => Category::QueryAnalysis,
            "enrichment" => Category::Enrichment,
            "jurisprudence" => Category::Jurisprudence,
            "template" => Category::Template,
            _ => Category::Other(s.to_string()),
        })
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Category::from(s.to_string())
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category to TTL table
///
/// Overrides are keyed by the category tag and win over the built-in values.
/// Unknown categories never cache longer than `default_ttl`.
#[derive(Debug, Clone)]
pub struct ExpirationPolicy {
    overrides: HashMap<String, u64>,
    default_ttl_secs: u64,
}

impl ExpirationPolicy {
    pub fn new(overrides: HashMap<String, u64>, default_ttl_secs: u64) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(tag, secs)| (tag.to_lowercase(), secs))
            .collect();
        Self {
            overrides,
            default_ttl_secs,
        }
    }

    /// Time-to-live for entries of a category
    pub fn ttl(&self, category: &Category) -> Duration {
        let secs = self
            .overrides
            .get(&category.as_str().to_lowercase())
            .copied()
            .or_else(|| category.builtin_ttl_secs())
            .unwrap_or_else(|| {
                debug!(
                    "No TTL configured for category '{}', using default of {}s",
                    category, self.default_ttl_secs
                );
                self.default_ttl_secs
            });
        Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::new(HashMap::new(), DEFAULT_TTL_SECS)
    }
}
