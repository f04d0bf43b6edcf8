//! Read-through cache for resolutions.

use crate::config::{CacheConfig, Invalidation};
use crate::errors::CacheError;
use crate::negative_cache::NegativeCache;
use crate::resolver::Resolution;
use crate::types::FilterCombination;
use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key under which the resolution for (project, filter) is cached.
pub fn cache_key(project_id: &str, filter: &FilterCombination) -> String {
    format!("{project_id}:{}", filter.canonical_key())
}

#[async_trait]
pub trait ResolutionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Resolution>, CacheError>;
    async fn set(&self, key: &str, value: Resolution, ttl: Duration) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct CachedResolution {
    value: Arc<Resolution>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was stored with.
struct StoredTtl;

impl Expiry<String, CachedResolution> for StoredTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResolution,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedResolution,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backed by moka.
pub struct MokaResolutionCache {
    cache: Cache<String, CachedResolution>,
}

impl MokaResolutionCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(StoredTtl)
            .build();

        MokaResolutionCache { cache }
    }
}

#[async_trait]
impl ResolutionCache for MokaResolutionCache {
    async fn get(&self, key: &str) -> Result<Option<Resolution>, CacheError> {
        Ok(self.cache.get(key).map(|cached| (*cached.value).clone()))
    }

    async fn set(&self, key: &str, value: Resolution, ttl: Duration) -> Result<(), CacheError> {
        self.cache.insert(
            key.to_string(),
            CachedResolution {
                value: Arc::new(value),
                ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key);
        Ok(())
    }
}

/// Evicts resolution cache entries after a write, when the configured policy
/// asks for it. With `ttl_only` every call is a no-op.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn ResolutionCache>,
    negative: Arc<NegativeCache>,
    policy: Invalidation,
}

impl CacheInvalidator {
    pub fn new(
        cache: Arc<dyn ResolutionCache>,
        negative: Arc<NegativeCache>,
        policy: Invalidation,
    ) -> Self {
        CacheInvalidator {
            cache,
            negative,
            policy,
        }
    }

    pub fn from_config(
        cache: Arc<dyn ResolutionCache>,
        negative: Arc<NegativeCache>,
        config: &CacheConfig,
    ) -> Self {
        CacheInvalidator::new(cache, negative, config.invalidation)
    }

    /// Failures are logged; a missed eviction only means a read stale by one TTL.
    pub async fn invalidate(&self, project_id: &str, filters: &[FilterCombination]) {
        if self.policy != Invalidation::OnWrite {
            return;
        }

        for filter in filters {
            let key = cache_key(project_id, filter);
            self.negative.remove(&key);
            if let Err(e) = self.cache.invalidate(&key).await {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Failed to invalidate resolution cache entry"
                );
            }
        }
    }
}
