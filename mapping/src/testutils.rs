use crate::cache::MokaResolutionCache;
use crate::config::Config;
use crate::errors::StoreError;
use crate::service::MappingService;
use crate::store::{ConfigQuery, MasterQuery, MasterUpdate, MemoryStore, Store, UpsertOutcome};
use crate::types::{
    BundleSnapshots, ConfigBundle, ConfigKind, ConfigType, FilterCombination, FilterDimension,
    MasterEntry, Params, Project, ProjectEnv, Status,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const OWNER: &str = "owner@example.com";
pub const EDITOR: &str = "editor@example.com";
pub const VIEWER: &str = "viewer@example.com";
pub const STRANGER: &str = "stranger@example.com";

pub const PROJECT_ID: &str = "acme-game_0001";
pub const COMPANY_ID: &str = "acme_0001";

/// A project with one member per role and a custom `banner` config type.
pub fn test_project() -> Project {
    let mut config_types = ConfigType::builtin();
    config_types.push(ConfigType::new("banner", "Home screen banner"));

    Project {
        project_id: PROJECT_ID.into(),
        company_id: COMPANY_ID.into(),
        name: "Acme Game".into(),
        env: ProjectEnv::Dev,
        status: Status::Active,
        owners: vec![OWNER.into()],
        editors: vec![EDITOR.into()],
        viewers: vec![VIEWER.into()],
        config_types,
        created_at: 0,
        updated_at: 0,
    }
}

/// COUNTRY {IN, US} defaulting to IN, SUBSCRIPTION {FREE, PAID} defaulting to FREE.
pub fn test_dimensions() -> Vec<FilterDimension> {
    vec![
        FilterDimension::new("COUNTRY", 1, ["IN", "US"], "IN"),
        FilterDimension::new("SUBSCRIPTION", 2, ["FREE", "PAID"], "FREE"),
    ]
}

pub fn filter(country: &str, subscription: &str) -> FilterCombination {
    [("COUNTRY", country), ("SUBSCRIPTION", subscription)]
        .into_iter()
        .collect()
}

pub fn params(value: serde_json::Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

pub fn config_bundle(
    project: &Project,
    config_id: &str,
    kind: ConfigKind,
    value: serde_json::Value,
) -> ConfigBundle {
    ConfigBundle {
        config_id: config_id.into(),
        project_id: project.project_id.clone(),
        company_id: project.company_id.clone(),
        name: config_id.to_uppercase(),
        desc: String::new(),
        kind,
        params: params(value),
        status: Status::Active,
        created_at: 0,
        updated_at: 0,
    }
}

/// Store holding the test project and its dimensions.
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_project(test_project()).await.unwrap();
    for dimension in test_dimensions() {
        store.insert_dimension(PROJECT_ID, dimension).await.unwrap();
    }
    store
}

/// A running service over a seeded store.
pub async fn seeded_service(config: &Config) -> (MappingService, Arc<MemoryStore>) {
    let store = seeded_store().await;
    let cache = Arc::new(MokaResolutionCache::new(config.cache.max_capacity));
    let service = MappingService::new(store.clone(), cache, config);
    (service, store)
}

/// Wraps a store and fails selected writes on demand.
pub struct FaultyStore {
    inner: MemoryStore,
    failing_updates: AtomicUsize,
    // (dimension, value): upserts of filters carrying it fail
    failing_upserts: Mutex<Option<(String, String)>>,
    config_write_delay: Mutex<Option<Duration>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        FaultyStore {
            inner,
            failing_updates: AtomicUsize::new(0),
            failing_upserts: Mutex::new(None),
            config_write_delay: Mutex::new(None),
        }
    }

    /// The next `n` calls to `update_masters` fail.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// The next bundle write sleeps for `delay` before reaching the store.
    pub fn delay_next_config_write(&self, delay: Duration) {
        *self.config_write_delay.lock() = Some(delay);
    }

    pub fn fail_upserts_with(&self, dimension: &str, value: &str) {
        *self.failing_upserts.lock() = Some((dimension.into(), value.into()));
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("injected failure".into())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        self.inner.get_project(project_id).await
    }

    async fn find_projects(&self, company_id: &str) -> Result<Vec<Project>, StoreError> {
        self.inner.find_projects(company_id).await
    }

    async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        self.inner.insert_project(project).await
    }

    async fn replace_project(&self, project: Project) -> Result<bool, StoreError> {
        self.inner.replace_project(project).await
    }

    async fn list_dimensions(&self, project_id: &str) -> Result<Vec<FilterDimension>, StoreError> {
        self.inner.list_dimensions(project_id).await
    }

    async fn insert_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError> {
        self.inner.insert_dimension(project_id, dimension).await
    }

    async fn replace_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError> {
        self.inner.replace_dimension(project_id, dimension).await
    }

    async fn delete_dimension(&self, project_id: &str, name: &str) -> Result<bool, StoreError> {
        self.inner.delete_dimension(project_id, name).await
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<ConfigBundle>, StoreError> {
        self.inner.get_config(config_id).await
    }

    async fn find_configs(&self, query: &ConfigQuery) -> Result<Vec<ConfigBundle>, StoreError> {
        self.inner.find_configs(query).await
    }

    async fn insert_config(&self, bundle: ConfigBundle) -> Result<(), StoreError> {
        self.inner.insert_config(bundle).await
    }

    async fn replace_active_config(&self, bundle: ConfigBundle) -> Result<bool, StoreError> {
        let delay = self.config_write_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.replace_active_config(bundle).await
    }

    async fn deactivate_configs(
        &self,
        query: &ConfigQuery,
    ) -> Result<Vec<ConfigBundle>, StoreError> {
        self.inner.deactivate_configs(query).await
    }

    async fn upsert_master(
        &self,
        project_id: &str,
        company_id: &str,
        filter: &FilterCombination,
        bundles: BundleSnapshots,
    ) -> Result<UpsertOutcome, StoreError> {
        let fails = self
            .failing_upserts
            .lock()
            .as_ref()
            .is_some_and(|(name, value)| filter.get(name) == Some(value.as_str()));
        if fails {
            return Err(FaultyStore::unavailable());
        }
        self.inner
            .upsert_master(project_id, company_id, filter, bundles)
            .await
    }

    async fn find_master(
        &self,
        project_id: &str,
        filter: &FilterCombination,
    ) -> Result<Option<MasterEntry>, StoreError> {
        self.inner.find_master(project_id, filter).await
    }

    async fn find_masters(&self, query: &MasterQuery) -> Result<Vec<MasterEntry>, StoreError> {
        self.inner.find_masters(query).await
    }

    async fn update_masters(
        &self,
        query: &MasterQuery,
        update: &MasterUpdate,
    ) -> Result<Vec<MasterEntry>, StoreError> {
        let failed = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(FaultyStore::unavailable());
        }
        self.inner.update_masters(query, update).await
    }
}
