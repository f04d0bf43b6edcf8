use crate::access::require_role;
use crate::cache::{CacheInvalidator, ResolutionCache};
use crate::catalog::CatalogService;
use crate::config::Config;
use crate::configs::ConfigService;
use crate::consistency::ConsistencyMaintainer;
use crate::errors::Result;
use crate::expander::expand_filter;
use crate::master::MappingIndex;
use crate::negative_cache::NegativeCache;
use crate::projects::ProjectService;
use crate::resolver::Resolver;
use crate::store::Store;
use crate::types::{Caller, FilterCombination, FilterRequest, Role};
use shared::deadline::Deadline;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct ServiceInner {
    store: Arc<dyn Store>,
    projects: ProjectService,
    catalog: CatalogService,
    configs: ConfigService,
    mappings: MappingIndex,
    resolver: Resolver,
    maintainer: ConsistencyMaintainer,
    worker: tokio::task::JoinHandle<()>,
    client_salt: Option<String>,
    request_timeout: Duration,
    // Used by the readiness probe. Cleared when shutdown begins.
    ready: AtomicBool,
}

/// Every component wired over one store and one cache. Cloning is cheap.
#[derive(Clone)]
pub struct MappingService {
    inner: Arc<ServiceInner>,
}

impl MappingService {
    /// Spawns the propagation worker, so this must run inside a tokio runtime.
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn ResolutionCache>, config: &Config) -> Self {
        let negative = Arc::new(NegativeCache::new(
            config.cache.max_capacity,
            config.cache.negative_ttl(),
        ));
        let invalidator =
            CacheInvalidator::from_config(cache.clone(), negative.clone(), &config.cache);

        let (maintainer, worker) =
            ConsistencyMaintainer::spawn(store.clone(), invalidator.clone(), &config.consistency);

        let catalog = CatalogService::new(store.clone());
        let inner = ServiceInner {
            projects: ProjectService::new(store.clone(), maintainer.clone()),
            configs: ConfigService::new(store.clone(), maintainer.clone()),
            mappings: MappingIndex::new(
                store.clone(),
                catalog.clone(),
                invalidator,
                config.mapping.fanout_concurrency,
            ),
            resolver: Resolver::new(store.clone(), cache, negative, config.cache.ttl()),
            catalog,
            maintainer,
            worker,
            store,
            client_salt: config.resolver.client_salt.clone(),
            request_timeout: config.resolver.request_timeout(),
            ready: AtomicBool::new(true),
        };

        MappingService {
            inner: Arc::new(inner),
        }
    }

    pub fn projects(&self) -> &ProjectService {
        &self.inner.projects
    }

    pub fn catalog(&self) -> &CatalogService {
        &self.inner.catalog
    }

    pub fn configs(&self) -> &ConfigService {
        &self.inner.configs
    }

    pub fn mappings(&self) -> &MappingIndex {
        &self.inner.mappings
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn maintainer(&self) -> &ConsistencyMaintainer {
        &self.inner.maintainer
    }

    pub fn client_salt(&self) -> Option<&str> {
        self.inner.client_salt.as_deref()
    }

    /// Deadline for a request starting now.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.inner.request_timeout)
    }

    /// Previews what a mapping request would write.
    pub async fn expand_filter(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        request: &FilterRequest,
    ) -> Result<Vec<FilterCombination>> {
        require_role(self.inner.store.as_ref(), deadline, project_id, caller, Role::Viewer).await?;
        let catalog = self.inner.catalog.load(deadline, project_id).await?;
        Ok(expand_filter(&catalog, request))
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed) && !self.inner.worker.is_finished()
    }

    /// Stops reporting ready and drains the propagation queue.
    pub async fn shutdown(&self) {
        self.inner.ready.store(false, Ordering::Relaxed);
        self.inner.maintainer.flush().await;
        tracing::info!("Propagation queue drained");
    }
}
