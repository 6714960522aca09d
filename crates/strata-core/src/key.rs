//! Cache key derivation
//!
//! A key is `<category>:<sha256 hex>` where the digest covers the category
//! and a canonical, type-tagged encoding of the parameters. Object keys are
//! sorted at every nesting level, so two maps holding the same entries
//! always produce the same key no matter how they were built.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::cache::Category;
use crate::error::CacheError;

/// A derived cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    key: String,
    category_len: usize,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The category tag at the front of the key
    pub fn category(&self) -> &str {
        &self.key[..self.category_len]
    }

    /// The record name the disk tier stores this key under
    pub fn storage_name(&self) -> String {
        strata_storage::backend::record_name(&self.key)
    }

    pub fn into_string(self) -> String {
        self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// Build the cache key for a category and a parameter map
///
/// `params` must serialize to a JSON object. Anything else, including maps
/// with non-string keys, is rejected with `InvalidKeyInput`.
pub fn build_key<P>(category: &Category, params: &P) -> Result<CacheKey, CacheError>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params)
        .map_err(|e| CacheError::InvalidKeyInput(format!("unserializable parameters: {}", e)))?;

    if !value.is_object() {
        return Err(CacheError::InvalidKeyInput(format!(
            "parameters must be a map of named values, got {}",
            type_name(&value)
        )));
    }

    let tag = category.as_str();
    let mut canonical = String::new();
    canonicalize(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Ok(CacheKey {
        key: format!("{}:{}", tag, digest),
        category_len: tag.len(),
    })
}

fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push('n'),
        Value::Bool(b) => {
            out.push_str(if *b { "b:1" } else { "b:0" });
        }
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                out.push_str(&format!("u:{}", u));
            } else if let Some(i) = n.as_i64() {
                out.push_str(&format!("i:{}", i));
            } else {
                // Only finite floats reach here; serde_json maps NaN/inf to null
                let f = n.as_f64().unwrap_or_default();
                out.push_str(&format!("f:{:e}", f));
            }
        }
        Value::String(s) => push_str_tagged(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_str_tagged(k, out);
                out.push('=');
                canonicalize(v, out);
            }
            out.push('}');
        }
    }
}

/// Length-prefixed so separators inside strings cannot collide
fn push_str_tagged(s: &str, out: &mut String) {
    out.push_str(&format!("s{}:", s.len()));
    out.push_str(s);
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
