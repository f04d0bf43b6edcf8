// Short-lived record of keys that recently resolved to NO_MAPPING, so repeated
// misses for an unmapped filter do not each reach the store.
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

pub struct NegativeCache {
    cache: Cache<String, ()>,
}

impl NegativeCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, key: &str) {
        self.cache.insert(key.to_string(), ());
    }

    pub fn contains(&self, key: &str) -> bool {
        let cache_hit = self.cache.contains_key(key);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }
}
