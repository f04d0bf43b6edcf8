//! Index from an exact filter combination to the bundles a client receives.

use crate::access::require_role;
use crate::cache::CacheInvalidator;
use crate::catalog::CatalogService;
use crate::cursor::MappingCursor;
use crate::errors::{CoreError, Result};
use crate::expander::expand_filter;
use crate::metrics_defs::FANOUT_ENTRIES_WRITTEN;
use crate::store::{MasterQuery, MasterUpdate, Store, UpsertOutcome};
use crate::types::{
    BundleSnapshots, Caller, ConfigId, ConfigKind, FilterCombination, FilterRequest, MasterEntry,
    Project, Role, Status,
};
use serde::{Deserialize, Serialize};
use shared::deadline::Deadline;
use shared::histogram;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 500;

/// The bundles a new mapping points at. Unset slots resolve to defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConfigRefs {
    pub app: Option<ConfigId>,
    pub player: Option<ConfigId>,
    /// Config type name to config id.
    #[serde(default)]
    pub custom: BTreeMap<String, ConfigId>,
}

impl ConfigRefs {
    pub fn is_empty(&self) -> bool {
        self.app.is_none() && self.player.is_none() && self.custom.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (ConfigKind, &str)> {
        let app = self.app.as_deref().map(|id| (ConfigKind::App, id));
        let player = self.player.as_deref().map(|id| (ConfigKind::Player, id));
        let custom = self
            .custom
            .iter()
            .map(|(name, id)| (ConfigKind::Custom(name.clone()), id.as_str()));
        app.into_iter().chain(player).chain(custom)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MappingPage {
    pub entries: Vec<MasterEntry>,
    /// Absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct MappingIndex {
    store: Arc<dyn Store>,
    catalog: CatalogService,
    invalidator: CacheInvalidator,
    fanout_concurrency: usize,
}

impl MappingIndex {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: CatalogService,
        invalidator: CacheInvalidator,
        fanout_concurrency: usize,
    ) -> Self {
        MappingIndex {
            store,
            catalog,
            invalidator,
            fanout_concurrency: fanout_concurrency.max(1),
        }
    }

    /// Replaces the active entry for (project, filter), or inserts one.
    pub async fn upsert(
        &self,
        deadline: &Deadline,
        project_id: &str,
        company_id: &str,
        filter: &FilterCombination,
        bundles: BundleSnapshots,
    ) -> Result<UpsertOutcome> {
        let outcome = deadline
            .run(self.store.upsert_master(project_id, company_id, filter, bundles))
            .await??;
        self.invalidator
            .invalidate(project_id, std::slice::from_ref(filter))
            .await;
        Ok(outcome)
    }

    pub async fn retire(
        &self,
        deadline: &Deadline,
        project_id: &str,
        filter: &FilterCombination,
    ) -> Result<()> {
        let query = MasterQuery {
            filter: Some(filter.clone()),
            ..MasterQuery::active_in(project_id)
        };
        let retired = deadline
            .run(
                self.store
                    .update_masters(&query, &MasterUpdate::SetStatus(Status::Inactive)),
            )
            .await??;
        if retired.is_empty() {
            return Err(CoreError::not_found("mapping", &filter.canonical_key()));
        }

        self.invalidator
            .invalidate(project_id, std::slice::from_ref(filter))
            .await;
        Ok(())
    }

    /// Maps every combination `request` expands to onto the referenced
    /// bundles and returns the number of entries written.
    ///
    /// If some upserts fail the ones that succeeded stay applied and
    /// `PartialFanOut` lists the combinations still to write. If none
    /// succeeded the first failure is returned as is.
    pub async fn create_mapping(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        refs: &ConfigRefs,
        request: &FilterRequest,
    ) -> Result<usize> {
        let project =
            require_role(self.store.as_ref(), deadline, project_id, caller, Role::Editor).await?;
        if refs.is_empty() {
            return Err(CoreError::Validation(
                "a mapping needs at least one config".into(),
            ));
        }

        let bundles = self.snapshot_refs(deadline, &project, refs).await?;
        let catalog = self.catalog.load(deadline, project_id).await?;
        let combinations = expand_filter(&catalog, request);

        let written = self.fan_out(deadline, &project, combinations, bundles).await?;

        histogram!(FANOUT_ENTRIES_WRITTEN).record(written as f64);
        tracing::info!(project_id, entries = written, "Created mapping");
        Ok(written)
    }

    /// Retires every active entry `request` expands to.
    pub async fn delete_mapping(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        request: &FilterRequest,
    ) -> Result<usize> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Editor).await?;
        let catalog = self.catalog.load(deadline, project_id).await?;

        let mut retired = 0;
        for filter in expand_filter(&catalog, request) {
            match self.retire(deadline, project_id, &filter).await {
                Ok(()) => retired += 1,
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if retired == 0 {
            return Err(CoreError::not_found("mapping", project_id));
        }
        tracing::info!(project_id, entries = retired, "Deleted mapping");
        Ok(retired)
    }

    pub async fn get_active_mapping(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        filter: &FilterCombination,
    ) -> Result<MasterEntry> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Viewer).await?;
        deadline
            .run(self.store.find_master(project_id, filter))
            .await??
            .ok_or_else(|| CoreError::not_found("mapping", &filter.canonical_key()))
    }

    /// Active entries ordered by canonical filter key.
    pub async fn list_mappings(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<MappingPage> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Viewer).await?;

        let after = cursor
            .map(|c| c.parse::<MappingCursor>())
            .transpose()
            .map_err(|e| CoreError::Validation(format!("bad cursor: {e}")))?
            .map(|c| c.after);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut keyed: Vec<(String, MasterEntry)> = deadline
            .run(self.store.find_masters(&MasterQuery::active_in(project_id)))
            .await??
            .into_iter()
            .map(|entry| (entry.filter.canonical_key(), entry))
            .filter(|(key, _)| after.as_ref().is_none_or(|after| key > after))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let next_cursor = if keyed.len() > limit {
            keyed.truncate(limit);
            keyed.last().map(|(key, _)| MappingCursor::new(key.clone()).encode())
        } else {
            None
        };

        Ok(MappingPage {
            entries: keyed.into_iter().map(|(_, entry)| entry).collect(),
            next_cursor,
        })
    }

    /// Retires active entries the current catalog no longer admits, e.g.
    /// after a dimension was removed. Returns the number retired.
    pub async fn prune_stale_mappings(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
    ) -> Result<usize> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Owner).await?;
        let catalog = self.catalog.load(deadline, project_id).await?;

        let stale: Vec<FilterCombination> = deadline
            .run(self.store.find_masters(&MasterQuery::active_in(project_id)))
            .await??
            .into_iter()
            .filter(|entry| !catalog.admits(&entry.filter))
            .map(|entry| entry.filter)
            .collect();

        for filter in &stale {
            self.retire(deadline, project_id, filter).await?;
        }

        tracing::info!(project_id, entries = stale.len(), "Pruned stale mappings");
        Ok(stale.len())
    }

    /// Resolves every reference to the active bundle it names.
    async fn snapshot_refs(
        &self,
        deadline: &Deadline,
        project: &Project,
        refs: &ConfigRefs,
    ) -> Result<BundleSnapshots> {
        let mut bundles = BundleSnapshots::default();

        for (kind, config_id) in refs.iter() {
            let bundle = deadline
                .run(self.store.get_config(config_id))
                .await??
                .filter(|b| b.is_active() && b.project_id == project.project_id && b.kind == kind)
                .ok_or_else(|| CoreError::not_found(ref_entity(&kind), config_id))?;
            bundles.set(&kind, bundle.snapshot());
        }

        Ok(bundles)
    }

    async fn fan_out(
        &self,
        deadline: &Deadline,
        project: &Project,
        combinations: Vec<FilterCombination>,
        bundles: BundleSnapshots,
    ) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.fanout_concurrency));
        let mut join_set = JoinSet::new();
        let mut pending: HashSet<FilterCombination> = HashSet::new();

        for filter in &combinations {
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let deadline = *deadline;
            let project_id = project.project_id.clone();
            let company_id = project.company_id.clone();
            let bundles = bundles.clone();
            let filter = filter.clone();

            pending.insert(filter.clone());
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => deadline
                        .run(store.upsert_master(&project_id, &company_id, &filter, bundles))
                        .await
                        .map_err(CoreError::from)
                        .and_then(|r| r.map_err(CoreError::from)),
                    Err(e) => Err(CoreError::Inconsistency(e.to_string())),
                };
                (filter, result)
            });
        }

        let mut written = Vec::new();
        let mut first_error = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((filter, Ok(_))) => {
                    pending.remove(&filter);
                    written.push(filter);
                }
                Ok((filter, Err(e))) => {
                    tracing::warn!(
                        project_id = %project.project_id,
                        filter = %filter.canonical_key(),
                        error = %e,
                        "Mapping upsert failed"
                    );
                    first_error.get_or_insert(e);
                }
                Err(e) => tracing::error!("Task panicked: {}", e),
            }
        }

        self.invalidator
            .invalidate(&project.project_id, &written)
            .await;

        if pending.is_empty() {
            return Ok(written.len());
        }
        if written.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        // Keep expansion order so a retry reads naturally.
        let remaining = combinations
            .into_iter()
            .filter(|c| pending.contains(c))
            .collect();
        Err(CoreError::PartialFanOut {
            written: written.len(),
            remaining,
        })
    }
}

fn ref_entity(kind: &ConfigKind) -> &'static str {
    match kind {
        ConfigKind::App => "app config",
        ConfigKind::Player => "player config",
        ConfigKind::Custom(_) => "custom config",
    }
}
