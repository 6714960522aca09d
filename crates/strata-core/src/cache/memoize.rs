//! Cache-aware wrapper around a producer function

use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use super::manager::TieredCache;
use super::policy::Category;
use crate::error::{CacheError, MemoizeError};

/// A producer bound to a cache and a category
///
/// Calling it with a parameter set returns the cached value for those
/// parameters, running the producer only on a miss:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use bytes::Bytes;
/// # use serde_json::{json, Value};
/// # use strata_core::{Category, CacheConfig, TieredCache};
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = Arc::new(TieredCache::open(CacheConfig::default()).await?);
/// let lookup = cache.memoize(Category::Enrichment, |params: &Value| {
///     let siren = params["siren"].as_str().unwrap_or_default().to_string();
///     async move { Ok::<_, std::io::Error>(Bytes::from(format!("company {}", siren))) }
/// });
///
/// let company = lookup.call(&json!({"siren": "552037806"})).await?;
/// # let _ = company;
/// # Ok(())
/// # }
/// ```
pub struct Memoized<F> {
    cache: Arc<TieredCache>,
    category: Category,
    producer: F,
}

impl<F> Memoized<F> {
    pub(crate) fn new(cache: Arc<TieredCache>, category: Category, producer: F) -> Self {
        Self {
            cache,
            category,
            producer,
        }
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    /// Cached call: the parameters are both the key and the producer input
    pub async fn call<P, Fut, E>(&self, params: &P) -> Result<Bytes, MemoizeError<E>>
    where
        P: Serialize + ?Sized,
        F: Fn(&P) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        self.call_with(params, params).await
    }

    /// Cached call where the key parameters differ from the producer input
    pub async fn call_with<K, I, Fut, E>(
        &self,
        key_params: &K,
        input: &I,
    ) -> Result<Bytes, MemoizeError<E>>
    where
        K: Serialize + ?Sized,
        I: ?Sized,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        self.cache
            .get_or_compute(&self.category, key_params, || (self.producer)(input))
            .await
    }

    /// Bypass the cache: run the producer and overwrite the stored value
    pub async fn refresh<P, Fut, E>(&self, params: &P) -> Result<Bytes, MemoizeError<E>>
    where
        P: Serialize + ?Sized,
        F: Fn(&P) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        self.cache
            .refresh(&self.category, params, || (self.producer)(params))
            .await
    }

    /// Drop the cached value for a parameter set
    pub async fn invalidate<P>(&self, params: &P) -> Result<bool, CacheError>
    where
        P: Serialize + ?Sized,
    {
        self.cache.invalidate(&self.category, params).await
    }
}
