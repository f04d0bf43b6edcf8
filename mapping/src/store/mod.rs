//! Persistence seam. Every component takes an `Arc<dyn Store>`; the only
//! ordering requirement is that `upsert_master` is atomic per key.

mod memory;
pub mod snapshot;

pub use memory::{MemoryStore, StoreData};

use crate::errors::StoreError;
use crate::types::{
    BundleSnapshots, ConfigBundle, ConfigKind, ConfigSnapshot, FilterCombination,
    FilterDimension, MasterEntry, Project, Status,
};
use async_trait::async_trait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Selects config bundles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigQuery {
    pub project_id: Option<String>,
    pub kind: Option<ConfigKind>,
    pub active_only: bool,
}

impl ConfigQuery {
    pub fn active_in(project_id: &str) -> Self {
        ConfigQuery {
            project_id: Some(project_id.to_string()),
            kind: None,
            active_only: true,
        }
    }

    pub fn with_kind(mut self, kind: ConfigKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, bundle: &ConfigBundle) -> bool {
        self.project_id
            .as_ref()
            .is_none_or(|p| *p == bundle.project_id)
            && self.kind.as_ref().is_none_or(|k| *k == bundle.kind)
            && (!self.active_only || bundle.is_active())
    }
}

/// Selects mapping entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MasterQuery {
    pub project_id: Option<String>,
    pub filter: Option<FilterCombination>,
    /// Entries whose slot for the kind holds this config id.
    pub embeds: Option<(ConfigKind, String)>,
    /// Entries carrying a snapshot for this custom config type.
    pub has_custom_type: Option<String>,
    pub active_only: bool,
}

impl MasterQuery {
    pub fn active_in(project_id: &str) -> Self {
        MasterQuery {
            project_id: Some(project_id.to_string()),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn embedding(bundle: &ConfigBundle) -> Self {
        MasterQuery {
            embeds: Some((bundle.kind.clone(), bundle.config_id.clone())),
            ..MasterQuery::active_in(&bundle.project_id)
        }
    }

    pub fn matches(&self, entry: &MasterEntry) -> bool {
        self.project_id
            .as_ref()
            .is_none_or(|p| *p == entry.project_id)
            && self.filter.as_ref().is_none_or(|f| *f == entry.filter)
            && self
                .embeds
                .as_ref()
                .is_none_or(|(kind, id)| entry.bundles.embeds(kind, id))
            && self
                .has_custom_type
                .as_ref()
                .is_none_or(|t| entry.bundles.custom_config.contains_key(t))
            && (!self.active_only || entry.is_active())
    }
}

/// Bulk modification applied by `update_masters`.
#[derive(Clone, Debug, PartialEq)]
pub enum MasterUpdate {
    SetStatus(Status),
    /// Overwrite the embedded snapshot in the slot for `kind`.
    ReplaceSnapshot {
        kind: ConfigKind,
        snapshot: ConfigSnapshot,
    },
}

impl MasterUpdate {
    pub fn apply(&self, entry: &mut MasterEntry) {
        match self {
            MasterUpdate::SetStatus(status) => entry.status = *status,
            MasterUpdate::ReplaceSnapshot { kind, snapshot } => {
                if let Some(slot) = entry.bundles.slot_mut(kind) {
                    *slot = snapshot.clone();
                }
            }
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;
    async fn find_projects(&self, company_id: &str) -> Result<Vec<Project>, StoreError>;
    async fn insert_project(&self, project: Project) -> Result<(), StoreError>;
    /// Returns false if no project with that id exists.
    async fn replace_project(&self, project: Project) -> Result<bool, StoreError>;

    /// Dimensions of a project, ordered by priority then name.
    async fn list_dimensions(&self, project_id: &str) -> Result<Vec<FilterDimension>, StoreError>;
    /// Returns false if the name is already taken.
    async fn insert_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError>;
    /// Returns false if no dimension with that name exists.
    async fn replace_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError>;
    async fn delete_dimension(&self, project_id: &str, name: &str) -> Result<bool, StoreError>;

    async fn get_config(&self, config_id: &str) -> Result<Option<ConfigBundle>, StoreError>;
    async fn find_configs(&self, query: &ConfigQuery) -> Result<Vec<ConfigBundle>, StoreError>;
    async fn insert_config(&self, bundle: ConfigBundle) -> Result<(), StoreError>;
    /// Replaces the stored bundle only while it is still active. Returns
    /// false when it is missing or was deactivated in the meantime.
    async fn replace_active_config(&self, bundle: ConfigBundle) -> Result<bool, StoreError>;
    /// Flips every matching active bundle to inactive and returns them.
    async fn deactivate_configs(
        &self,
        query: &ConfigQuery,
    ) -> Result<Vec<ConfigBundle>, StoreError>;

    /// Atomic find-and-replace-or-insert of the active entry for
    /// (project_id, filter).
    async fn upsert_master(
        &self,
        project_id: &str,
        company_id: &str,
        filter: &FilterCombination,
        bundles: BundleSnapshots,
    ) -> Result<UpsertOutcome, StoreError>;
    /// The active entry for the exact key, if any.
    async fn find_master(
        &self,
        project_id: &str,
        filter: &FilterCombination,
    ) -> Result<Option<MasterEntry>, StoreError>;
    async fn find_masters(&self, query: &MasterQuery) -> Result<Vec<MasterEntry>, StoreError>;
    /// Applies `update` to every matching entry and returns the updated entries.
    async fn update_masters(
        &self,
        query: &MasterQuery,
        update: &MasterUpdate,
    ) -> Result<Vec<MasterEntry>, StoreError>;
}
