use super::{ConfigQuery, MasterQuery, MasterUpdate, Store, UpsertOutcome};
use crate::errors::StoreError;
use crate::types::{
    BundleSnapshots, ConfigBundle, FilterCombination, FilterDimension, MasterEntry, Project,
    ProjectId, Status, unix_now,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Everything the store holds. This is also the snapshot file format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    pub projects: BTreeMap<ProjectId, Project>,
    pub dimensions: BTreeMap<ProjectId, Vec<FilterDimension>>,
    pub configs: BTreeMap<String, ConfigBundle>,
    /// Every entry ever written, active and retired.
    pub masters: Vec<MasterEntry>,
}

type MasterKey = (ProjectId, FilterCombination);

fn master_key(project_id: &str, filter: &FilterCombination) -> MasterKey {
    (project_id.to_string(), filter.clone())
}

struct Inner {
    data: StoreData,
    // (project, filter) -> position of the active entry in `data.masters`
    active: HashMap<MasterKey, usize>,
}

impl Inner {
    fn new(data: StoreData) -> Self {
        let active = data
            .masters
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_active())
            .map(|(pos, entry)| (master_key(&entry.project_id, &entry.filter), pos))
            .collect();

        Inner { data, active }
    }
}

/// Document store kept in process memory. Each operation runs under a single
/// lock acquisition, which makes `upsert_master` atomic per key.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::from_data(StoreData::default())
    }

    pub fn from_data(data: StoreData) -> Self {
        MemoryStore {
            inner: RwLock::new(Inner::new(data)),
        }
    }

    /// Copy of the current contents, for persisting.
    pub fn export(&self) -> StoreData {
        self.inner.read().data.clone()
    }
}

fn sort_dimensions(dimensions: &mut [FilterDimension]) {
    dimensions.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.inner.read().data.projects.get(project_id).cloned())
    }

    async fn find_projects(&self, company_id: &str) -> Result<Vec<Project>, StoreError> {
        Ok(self
            .inner
            .read()
            .data
            .projects
            .values()
            .filter(|p| p.company_id == company_id)
            .cloned()
            .collect())
    }

    async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        if guard.data.projects.contains_key(&project.project_id) {
            return Err(StoreError::DuplicateKey(project.project_id));
        }
        guard
            .data
            .projects
            .insert(project.project_id.clone(), project);
        Ok(())
    }

    async fn replace_project(&self, project: Project) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        match guard.data.projects.get_mut(&project.project_id) {
            Some(existing) => {
                *existing = project;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_dimensions(&self, project_id: &str) -> Result<Vec<FilterDimension>, StoreError> {
        let mut dimensions = self
            .inner
            .read()
            .data
            .dimensions
            .get(project_id)
            .cloned()
            .unwrap_or_default();
        sort_dimensions(&mut dimensions);
        Ok(dimensions)
    }

    async fn insert_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        let dimensions = guard
            .data
            .dimensions
            .entry(project_id.to_string())
            .or_default();

        if dimensions.iter().any(|d| d.name == dimension.name) {
            return Ok(false);
        }
        dimensions.push(dimension);
        sort_dimensions(dimensions);
        Ok(true)
    }

    async fn replace_dimension(
        &self,
        project_id: &str,
        dimension: FilterDimension,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        let Some(dimensions) = guard.data.dimensions.get_mut(project_id) else {
            return Ok(false);
        };

        match dimensions.iter_mut().find(|d| d.name == dimension.name) {
            Some(existing) => {
                *existing = dimension;
                sort_dimensions(dimensions);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_dimension(&self, project_id: &str, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        let Some(dimensions) = guard.data.dimensions.get_mut(project_id) else {
            return Ok(false);
        };

        let before = dimensions.len();
        dimensions.retain(|d| d.name != name);
        Ok(dimensions.len() != before)
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<ConfigBundle>, StoreError> {
        Ok(self.inner.read().data.configs.get(config_id).cloned())
    }

    async fn find_configs(&self, query: &ConfigQuery) -> Result<Vec<ConfigBundle>, StoreError> {
        Ok(self
            .inner
            .read()
            .data
            .configs
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }

    async fn insert_config(&self, bundle: ConfigBundle) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        if guard.data.configs.contains_key(&bundle.config_id) {
            return Err(StoreError::DuplicateKey(bundle.config_id));
        }
        guard.data.configs.insert(bundle.config_id.clone(), bundle);
        Ok(())
    }

    async fn replace_active_config(&self, bundle: ConfigBundle) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        match guard.data.configs.get_mut(&bundle.config_id) {
            Some(existing) if existing.is_active() => {
                *existing = bundle;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_configs(
        &self,
        query: &ConfigQuery,
    ) -> Result<Vec<ConfigBundle>, StoreError> {
        let now = unix_now();
        let mut guard = self.inner.write();
        let mut flipped = Vec::new();

        for bundle in guard.data.configs.values_mut() {
            if bundle.is_active() && query.matches(bundle) {
                bundle.status = Status::Inactive;
                bundle.updated_at = now;
                flipped.push(bundle.clone());
            }
        }

        Ok(flipped)
    }

    async fn upsert_master(
        &self,
        project_id: &str,
        company_id: &str,
        filter: &FilterCombination,
        bundles: BundleSnapshots,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = unix_now();
        let key = master_key(project_id, filter);
        let mut guard = self.inner.write();

        if let Some(&pos) = guard.active.get(&key) {
            let entry = &mut guard.data.masters[pos];
            entry.company_id = company_id.to_string();
            entry.bundles = bundles;
            entry.updated_at = now;
            return Ok(UpsertOutcome::Replaced);
        }

        guard.data.masters.push(MasterEntry {
            project_id: project_id.to_string(),
            company_id: company_id.to_string(),
            filter: filter.clone(),
            bundles,
            status: Status::Active,
            created_at: now,
            updated_at: now,
        });
        let pos = guard.data.masters.len() - 1;
        guard.active.insert(key, pos);

        Ok(UpsertOutcome::Inserted)
    }

    async fn find_master(
        &self,
        project_id: &str,
        filter: &FilterCombination,
    ) -> Result<Option<MasterEntry>, StoreError> {
        let guard = self.inner.read();
        Ok(guard
            .active
            .get(&master_key(project_id, filter))
            .map(|&pos| &guard.data.masters[pos])
            .filter(|entry| entry.filter == *filter)
            .cloned())
    }

    async fn find_masters(&self, query: &MasterQuery) -> Result<Vec<MasterEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .data
            .masters
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }

    async fn update_masters(
        &self,
        query: &MasterQuery,
        update: &MasterUpdate,
    ) -> Result<Vec<MasterEntry>, StoreError> {
        let now = unix_now();
        let mut guard = self.inner.write();
        let Inner { data, active } = &mut *guard;
        let mut updated = Vec::new();

        for (pos, entry) in data.masters.iter_mut().enumerate() {
            if !query.matches(entry) {
                continue;
            }

            let key = master_key(&entry.project_id, &entry.filter);
            match update {
                MasterUpdate::SetStatus(Status::Inactive) => {
                    if active.get(&key) == Some(&pos) {
                        active.remove(&key);
                    }
                }
                // Reactivating must not create a second active entry for the key.
                MasterUpdate::SetStatus(Status::Active) => {
                    if active.get(&key).is_some_and(|&other| other != pos) {
                        continue;
                    }
                    active.insert(key, pos);
                }
                MasterUpdate::ReplaceSnapshot { .. } => {}
            }

            update.apply(entry);
            entry.updated_at = now;
            updated.push(entry.clone());
        }

        Ok(updated)
    }
}
