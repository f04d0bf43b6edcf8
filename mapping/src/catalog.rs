//! Per-project filter dimensions.

use crate::access::require_role;
use crate::errors::{CoreError, Result};
use crate::store::Store;
use crate::types::{Caller, FilterCombination, FilterDimension, Role};
use shared::deadline::Deadline;
use std::sync::Arc;

/// The dimensions of one project in catalog order: ascending priority, then
/// name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterCatalog {
    dimensions: Vec<FilterDimension>,
}

impl FilterCatalog {
    pub fn new<I: IntoIterator<Item = FilterDimension>>(dimensions: I) -> Self {
        let mut dimensions: Vec<_> = dimensions.into_iter().collect();
        dimensions.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        FilterCatalog { dimensions }
    }

    pub fn dimensions(&self) -> &[FilterDimension] {
        &self.dimensions
    }

    pub fn get(&self, name: &str) -> Option<&FilterDimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// The combination selected when every dimension is left unspecified.
    pub fn defaults(&self) -> FilterCombination {
        self.dimensions
            .iter()
            .map(|d| (d.name.clone(), d.default.clone()))
            .collect()
    }

    /// True if `filter` names exactly this catalog's dimensions. Values are
    /// not checked, as literal values outside a dimension's list are allowed.
    pub fn admits(&self, filter: &FilterCombination) -> bool {
        filter.len() == self.dimensions.len()
            && self.dimensions.iter().all(|d| filter.get(&d.name).is_some())
    }

    pub fn check_insert(&self, dimension: &FilterDimension) -> Result<()> {
        validate_dimension(dimension)?;

        if self.get(&dimension.name).is_some() {
            return Err(CoreError::Conflict(format!(
                "filter {} already exists",
                dimension.name
            )));
        }
        self.check_priority_free(dimension)
    }

    pub fn check_update(&self, dimension: &FilterDimension) -> Result<()> {
        validate_dimension(dimension)?;

        if self.get(&dimension.name).is_none() {
            return Err(CoreError::not_found("filter", &dimension.name));
        }
        self.check_priority_free(dimension)
    }

    fn check_priority_free(&self, dimension: &FilterDimension) -> Result<()> {
        match self
            .dimensions
            .iter()
            .find(|d| d.priority == dimension.priority && d.name != dimension.name)
        {
            Some(owner) => Err(CoreError::Conflict(format!(
                "priority {} is already used by filter {}",
                dimension.priority, owner.name
            ))),
            None => Ok(()),
        }
    }
}

/// Field checks that do not depend on the rest of the catalog.
pub fn validate_dimension(dimension: &FilterDimension) -> Result<()> {
    if dimension.name.trim().is_empty() {
        return Err(CoreError::Validation("filter name is required".into()));
    }
    if dimension.name == crate::expander::ALL_TOKEN {
        return Err(CoreError::Validation(format!(
            "{} is reserved",
            crate::expander::ALL_TOKEN
        )));
    }
    if dimension.values.is_empty() {
        return Err(CoreError::Validation(format!(
            "filter {} needs at least one value",
            dimension.name
        )));
    }
    if !dimension.default.is_empty() && !dimension.has_value(&dimension.default) {
        return Err(CoreError::Conflict(format!(
            "default {} is not a value of filter {}",
            dimension.default, dimension.name
        )));
    }
    Ok(())
}

/// Catalog mutations. Editors and owners may change dimensions; any member
/// may read them.
#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn Store>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        CatalogService { store }
    }

    /// Loads the catalog without an authorization check, for internal use.
    pub async fn load(&self, deadline: &Deadline, project_id: &str) -> Result<FilterCatalog> {
        let dimensions = deadline.run(self.store.list_dimensions(project_id)).await??;
        Ok(FilterCatalog::new(dimensions))
    }

    pub async fn list_dimensions(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
    ) -> Result<FilterCatalog> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Viewer).await?;
        self.load(deadline, project_id).await
    }

    pub async fn add_dimension(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        mut dimension: FilterDimension,
    ) -> Result<FilterDimension> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Editor).await?;
        dimension.dedup_values();

        let catalog = self.load(deadline, project_id).await?;
        catalog.check_insert(&dimension)?;

        let inserted = deadline
            .run(self.store.insert_dimension(project_id, dimension.clone()))
            .await??;
        if !inserted {
            return Err(CoreError::Conflict(format!(
                "filter {} already exists",
                dimension.name
            )));
        }

        tracing::info!(project_id, filter = %dimension.name, "Added filter dimension");
        Ok(dimension)
    }

    pub async fn update_dimension(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        mut dimension: FilterDimension,
    ) -> Result<FilterDimension> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Editor).await?;
        dimension.dedup_values();

        let catalog = self.load(deadline, project_id).await?;
        catalog.check_update(&dimension)?;

        let replaced = deadline
            .run(self.store.replace_dimension(project_id, dimension.clone()))
            .await??;
        if !replaced {
            return Err(CoreError::not_found("filter", &dimension.name));
        }

        tracing::info!(project_id, filter = %dimension.name, "Updated filter dimension");
        Ok(dimension)
    }

    /// Existing mappings that use the dimension are left alone; see
    /// `MappingIndex::prune_stale_mappings`.
    pub async fn remove_dimension(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        name: &str,
    ) -> Result<()> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Editor).await?;

        let removed = deadline
            .run(self.store.delete_dimension(project_id, name))
            .await??;
        if !removed {
            return Err(CoreError::not_found("filter", name));
        }

        tracing::info!(project_id, filter = name, "Removed filter dimension");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutils::{EDITOR, VIEWER, test_project};

    fn catalog() -> FilterCatalog {
        FilterCatalog::new([
            FilterDimension::new("SUBSCRIPTION", 2, ["FREE", "PAID"], "FREE"),
            FilterDimension::new("COUNTRY", 1, ["IN", "US"], "IN"),
        ])
    }

    #[test]
    fn test_catalog_order_and_defaults() {
        let catalog = catalog();
        let names: Vec<_> = catalog.dimensions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["COUNTRY", "SUBSCRIPTION"]);

        let defaults: FilterCombination =
            [("COUNTRY", "IN"), ("SUBSCRIPTION", "FREE")].into_iter().collect();
        assert_eq!(catalog.defaults(), defaults);
        assert!(catalog.admits(&defaults));
    }

    #[test]
    fn test_admits() {
        let catalog = catalog();
        let literal_value: FilterCombination =
            [("COUNTRY", "UK"), ("SUBSCRIPTION", "FREE")].into_iter().collect();
        let missing_dimension: FilterCombination = [("COUNTRY", "IN")].into_iter().collect();
        let extra_dimension: FilterCombination =
            [("COUNTRY", "IN"), ("OS", "LG"), ("SUBSCRIPTION", "FREE")].into_iter().collect();
        assert!(catalog.admits(&literal_value));
        assert!(!catalog.admits(&missing_dimension));
        assert!(!catalog.admits(&extra_dimension));
    }

    #[test]
    fn test_check_insert() {
        let catalog = catalog();

        let duplicate_name = FilterDimension::new("COUNTRY", 9, ["IN"], "IN");
        assert!(matches!(catalog.check_insert(&duplicate_name), Err(CoreError::Conflict(_))));

        let duplicate_priority = FilterDimension::new("OS", 1, ["LG"], "LG");
        assert!(matches!(catalog.check_insert(&duplicate_priority), Err(CoreError::Conflict(_))));

        let bad_default = FilterDimension::new("OS", 3, ["LG"], "SONY");
        assert!(matches!(catalog.check_insert(&bad_default), Err(CoreError::Conflict(_))));

        let no_values = FilterDimension::new("OS", 3, Vec::<String>::new(), "");
        assert!(matches!(catalog.check_insert(&no_values), Err(CoreError::Validation(_))));

        let unset_default = FilterDimension::new("OS", 3, ["LG", "SONY"], "");
        assert!(catalog.check_insert(&unset_default).is_ok());
    }

    #[test]
    fn test_check_update() {
        let catalog = catalog();

        let missing = FilterDimension::new("OS", 3, ["LG"], "LG");
        assert_eq!(catalog.check_update(&missing), Err(CoreError::not_found("filter", "OS")));

        let steals_priority = FilterDimension::new("COUNTRY", 2, ["IN"], "IN");
        assert!(matches!(catalog.check_update(&steals_priority), Err(CoreError::Conflict(_))));

        let keeps_priority = FilterDimension::new("COUNTRY", 1, ["IN", "US", "UK"], "US");
        assert!(catalog.check_update(&keeps_priority).is_ok());
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let project = test_project();
        store.insert_project(project.clone()).await.unwrap();
        let service = CatalogService::new(store);
        let deadline = Deadline::none();
        let editor = Caller::new(EDITOR);
        let pid = project.project_id.as_str();

        service
            .add_dimension(
                &deadline,
                &editor,
                pid,
                FilterDimension::new("COUNTRY", 1, ["IN", "US", "IN"], "IN"),
            )
            .await
            .unwrap();

        let err = service
            .add_dimension(
                &deadline,
                &Caller::new(VIEWER),
                pid,
                FilterDimension::new("OS", 2, ["LG"], "LG"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let catalog = service.list_dimensions(&deadline, &Caller::new(VIEWER), pid).await.unwrap();
        assert_eq!(catalog.get("COUNTRY").unwrap().values, vec!["IN", "US"]);

        service
            .update_dimension(
                &deadline,
                &editor,
                pid,
                FilterDimension::new("COUNTRY", 5, ["IN", "US", "UK"], "UK"),
            )
            .await
            .unwrap();
        let catalog = service.load(&deadline, pid).await.unwrap();
        assert_eq!(catalog.get("COUNTRY").unwrap().default, "UK");

        service.remove_dimension(&deadline, &editor, pid, "COUNTRY").await.unwrap();
        let err = service.remove_dimension(&deadline, &editor, pid, "COUNTRY").await.unwrap_err();
        assert_eq!(err, CoreError::not_found("filter", "COUNTRY"));
        assert!(service.load(&deadline, pid).await.unwrap().is_empty());
    }
}
