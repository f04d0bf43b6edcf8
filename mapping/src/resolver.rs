//! Client-facing lookup of the bundle for one concrete filter tuple.

use crate::cache::{ResolutionCache, cache_key};
use crate::errors::Result;
use crate::metrics_defs::{RESOLUTION_CACHE_HIT, RESOLUTION_CACHE_MISS, RESOLUTIONS};
use crate::negative_cache::NegativeCache;
use crate::store::Store;
use crate::types::{CompanyId, ConfigSnapshot, FilterCombination, MasterEntry, ProjectId};
use serde::{Deserialize, Serialize};
use shared::counter;
use shared::deadline::Deadline;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionCode {
    Found,
    NoMapping,
}

impl ResolutionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionCode::Found => "FOUND",
            ResolutionCode::NoMapping => "NO_MAPPING",
        }
    }
}

/// What a client receives. App and player slots are always populated; an
/// unmapped slot carries the default snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub code: ResolutionCode,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<CompanyId>,
    pub filter: FilterCombination,
    pub app_config: ConfigSnapshot,
    pub player_config: ConfigSnapshot,
    #[serde(default)]
    pub custom_config: BTreeMap<String, ConfigSnapshot>,
}

impl Resolution {
    pub fn no_mapping(project_id: &str, filter: &FilterCombination) -> Self {
        Resolution {
            code: ResolutionCode::NoMapping,
            project_id: project_id.to_string(),
            company_id: None,
            filter: filter.clone(),
            app_config: ConfigSnapshot::app_default(),
            player_config: ConfigSnapshot::player_default(),
            custom_config: BTreeMap::new(),
        }
    }

    pub fn from_entry(entry: &MasterEntry) -> Self {
        let bundles = &entry.bundles;
        Resolution {
            code: ResolutionCode::Found,
            project_id: entry.project_id.clone(),
            company_id: Some(entry.company_id.clone()),
            filter: entry.filter.clone(),
            app_config: bundles
                .app_config
                .clone()
                .unwrap_or_else(ConfigSnapshot::app_default),
            player_config: bundles
                .player_config
                .clone()
                .unwrap_or_else(ConfigSnapshot::player_default),
            custom_config: bundles.custom_config.clone(),
        }
    }
}

pub struct Resolver {
    store: Arc<dyn Store>,
    cache: Arc<dyn ResolutionCache>,
    negative: Arc<NegativeCache>,
    ttl: Duration,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn ResolutionCache>,
        negative: Arc<NegativeCache>,
        ttl: Duration,
    ) -> Self {
        Resolver {
            store,
            cache,
            negative,
            ttl,
        }
    }

    /// Never fails for a missing mapping; only store failures and an expired
    /// deadline are errors.
    pub async fn resolve(
        &self,
        deadline: &Deadline,
        project_id: &str,
        filter: &FilterCombination,
        skip_cache: bool,
    ) -> Result<Resolution> {
        let key = cache_key(project_id, filter);

        if !skip_cache {
            if let Some(cached) = self.cached(deadline, &key).await {
                counter!(RESOLUTION_CACHE_HIT).increment(1);
                return Ok(record(cached));
            }
            counter!(RESOLUTION_CACHE_MISS).increment(1);

            if self.negative.contains(&key) {
                return Ok(record(Resolution::no_mapping(project_id, filter)));
            }
        }

        let entry = deadline
            .run(self.store.find_master(project_id, filter))
            .await??;

        let resolution = match entry {
            Some(entry) => {
                let resolution = Resolution::from_entry(&entry);
                self.store_in_cache(deadline, &key, resolution.clone()).await;
                resolution
            }
            None => {
                tracing::debug!(key = %key, "No mapping, serving defaults");
                self.negative.insert(&key);
                Resolution::no_mapping(project_id, filter)
            }
        };

        Ok(record(resolution))
    }

    async fn cached(&self, deadline: &Deadline, key: &str) -> Option<Resolution> {
        match deadline.run(self.cache.get(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::warn!(key, error = %e, "Resolution cache get failed, bypassing");
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Resolution cache get timed out, bypassing");
                None
            }
        }
    }

    async fn store_in_cache(&self, deadline: &Deadline, key: &str, resolution: Resolution) {
        match deadline.run(self.cache.set(key, resolution, self.ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key, error = %e, "Resolution cache set failed"),
            Err(e) => tracing::warn!(key, error = %e, "Resolution cache set timed out"),
        }
    }
}

fn record(resolution: Resolution) -> Resolution {
    counter!(RESOLUTIONS, "code" => resolution.code.as_str()).increment(1);
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaResolutionCache;
    use crate::errors::CacheError;
    use crate::store::MemoryStore;
    use crate::types::BundleSnapshots;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingCache;

    #[async_trait]
    impl ResolutionCache for FailingCache {
        async fn get(&self, _key: &str) -> std::result::Result<Option<Resolution>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn set(
            &self,
            _key: &str,
            _value: Resolution,
            _ttl: Duration,
        ) -> std::result::Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn invalidate(&self, _key: &str) -> std::result::Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    fn filter() -> FilterCombination {
        [("COUNTRY", "IN"), ("SUBSCRIPTION", "FREE")].into_iter().collect()
    }

    fn app_snapshot(theme: &str) -> BundleSnapshots {
        let mut bundles = BundleSnapshots::default();
        bundles.set(
            &crate::types::ConfigKind::App,
            ConfigSnapshot {
                config_id: "ac_1".into(),
                name: "A1".into(),
                desc: String::new(),
                params: json!({ "theme": theme }).as_object().cloned().unwrap(),
            },
        );
        bundles
    }

    fn resolver(store: Arc<MemoryStore>, cache: Arc<dyn ResolutionCache>) -> Resolver {
        Resolver::new(
            store,
            cache,
            Arc::new(NegativeCache::new(100, Duration::from_secs(60))),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_miss_serves_defaults() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store, Arc::new(MokaResolutionCache::new(100)));

        let resolution = resolver
            .resolve(&Deadline::none(), "p1", &filter(), false)
            .await
            .unwrap();
        assert_eq!(resolution.code, ResolutionCode::NoMapping);
        assert_eq!(resolution.app_config.config_id, "ac_default");
        assert_eq!(resolution.player_config.config_id, "pc_default");
        assert!(resolution.app_config.params.is_empty());
        assert!(resolution.custom_config.is_empty());
    }

    #[tokio::test]
    async fn test_found_fills_missing_slots() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_master("p1", "c1", &filter(), app_snapshot("dark"))
            .await
            .unwrap();
        let resolver = resolver(store, Arc::new(MokaResolutionCache::new(100)));

        let resolution = resolver
            .resolve(&Deadline::none(), "p1", &filter(), false)
            .await
            .unwrap();
        assert_eq!(resolution.code, ResolutionCode::Found);
        assert_eq!(resolution.company_id.as_deref(), Some("c1"));
        assert_eq!(resolution.app_config.params["theme"], "dark");
        assert_eq!(resolution.player_config.config_id, "pc_default");
    }

    #[tokio::test]
    async fn test_cached_resolution_is_stale_until_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_master("p1", "c1", &filter(), app_snapshot("light"))
            .await
            .unwrap();
        let resolver = resolver(store.clone(), Arc::new(MokaResolutionCache::new(100)));
        let deadline = Deadline::none();

        resolver.resolve(&deadline, "p1", &filter(), false).await.unwrap();
        store
            .upsert_master("p1", "c1", &filter(), app_snapshot("dark"))
            .await
            .unwrap();

        let cached = resolver.resolve(&deadline, "p1", &filter(), false).await.unwrap();
        assert_eq!(cached.app_config.params["theme"], "light");

        let fresh = resolver.resolve(&deadline, "p1", &filter(), true).await.unwrap();
        assert_eq!(fresh.app_config.params["theme"], "dark");

        let refreshed = resolver.resolve(&deadline, "p1", &filter(), false).await.unwrap();
        assert_eq!(refreshed.app_config.params["theme"], "dark");
    }

    #[tokio::test]
    async fn test_negative_cache_remembers_misses() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone(), Arc::new(MokaResolutionCache::new(100)));
        let deadline = Deadline::none();

        resolver.resolve(&deadline, "p1", &filter(), false).await.unwrap();
        store
            .upsert_master("p1", "c1", &filter(), app_snapshot("dark"))
            .await
            .unwrap();

        let remembered = resolver.resolve(&deadline, "p1", &filter(), false).await.unwrap();
        assert_eq!(remembered.code, ResolutionCode::NoMapping);

        let fresh = resolver.resolve(&deadline, "p1", &filter(), true).await.unwrap();
        assert_eq!(fresh.code, ResolutionCode::Found);
    }

    #[tokio::test]
    async fn test_cache_failures_are_bypassed() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_master("p1", "c1", &filter(), app_snapshot("dark"))
            .await
            .unwrap();
        let resolver = resolver(store, Arc::new(FailingCache));

        let resolution = resolver
            .resolve(&Deadline::none(), "p1", &filter(), false)
            .await
            .unwrap();
        assert_eq!(resolution.code, ResolutionCode::Found);
    }

    #[test]
    fn test_resolution_serializes_code() {
        let value = serde_json::to_value(Resolution::no_mapping("p1", &filter())).unwrap();
        assert_eq!(value["code"], "NO_MAPPING");
        assert_eq!(value["filter"]["COUNTRY"], "IN");
        assert!(value.get("company_id").is_none());
    }
}
