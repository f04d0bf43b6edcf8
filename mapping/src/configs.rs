//! Named configuration bundles scoped to a project.

use crate::access::require_role;
use crate::consistency::ConsistencyMaintainer;
use crate::errors::{CoreError, Result};
use crate::store::{ConfigQuery, Store};
use crate::types::{
    Caller, ConfigBundle, ConfigKind, Params, Project, ProjectId, Role, Status, unix_now,
};
use serde::Deserialize;
use shared::deadline::Deadline;
use shared::ids::generate_id;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NewConfig {
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub kind: ConfigKind,
    pub params: Params,
}

/// Fields left as `None` keep their current value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConfigPatch {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub params: Option<Params>,
}

impl ConfigPatch {
    fn apply(self, bundle: &mut ConfigBundle) {
        if let Some(name) = self.name {
            bundle.name = name.trim().to_string();
        }
        if let Some(desc) = self.desc {
            bundle.desc = desc;
        }
        if let Some(params) = self.params {
            bundle.params = params;
        }
    }
}

fn validate_fields(name: &str, params: &Params) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation("config name is required".into()));
    }
    if params.is_empty() {
        return Err(CoreError::Validation("config params cannot be empty".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ConfigService {
    store: Arc<dyn Store>,
    maintainer: ConsistencyMaintainer,
}

impl ConfigService {
    pub fn new(store: Arc<dyn Store>, maintainer: ConsistencyMaintainer) -> Self {
        ConfigService { store, maintainer }
    }

    pub async fn create(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        new: NewConfig,
    ) -> Result<ConfigBundle> {
        if new.project_id.trim().is_empty() {
            return Err(CoreError::Validation("project_id is required".into()));
        }
        validate_fields(&new.name, &new.params)?;

        let project =
            require_role(self.store.as_ref(), deadline, &new.project_id, caller, Role::Editor)
                .await?;
        check_kind_declared(&project, &new.kind)?;

        let name = new.name.trim().to_string();
        self.check_unique(deadline, &project.project_id, &new.kind, &name, &new.params, None)
            .await?;

        let now = unix_now();
        let bundle = ConfigBundle {
            config_id: generate_id(&format!("{}_{}", new.kind.id_prefix(), project.name)),
            project_id: project.project_id.clone(),
            company_id: project.company_id.clone(),
            name,
            desc: new.desc,
            kind: new.kind,
            params: new.params,
            status: Status::Active,
            created_at: now,
            updated_at: now,
        };
        deadline.run(self.store.insert_config(bundle.clone())).await??;

        tracing::info!(
            project_id = %bundle.project_id,
            config_id = %bundle.config_id,
            kind = %bundle.kind,
            "Created config"
        );
        Ok(bundle)
    }

    pub async fn update(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        config_id: &str,
        patch: ConfigPatch,
    ) -> Result<ConfigBundle> {
        let mut bundle = self.active_bundle(deadline, config_id).await?;
        require_role(self.store.as_ref(), deadline, &bundle.project_id, caller, Role::Editor)
            .await?;

        patch.apply(&mut bundle);
        validate_fields(&bundle.name, &bundle.params)?;
        self.check_unique(
            deadline,
            &bundle.project_id,
            &bundle.kind,
            &bundle.name,
            &bundle.params,
            Some(config_id),
        )
        .await?;

        bundle.updated_at = unix_now();
        if !deadline.run(self.store.replace_active_config(bundle.clone())).await?? {
            return Err(CoreError::not_found("config", config_id));
        }

        tracing::info!(project_id = %bundle.project_id, config_id, "Updated config");
        self.maintainer.on_config_updated(bundle.clone()).await;
        Ok(bundle)
    }

    /// Copies an active bundle under a fresh id. Without a name in
    /// `overrides` the copy is named `"<name> (copy)"`.
    pub async fn clone_config(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        config_id: &str,
        overrides: ConfigPatch,
    ) -> Result<ConfigBundle> {
        let source = self.active_bundle(deadline, config_id).await?;

        let mut copy = source.clone();
        copy.name = format!("{} (copy)", source.name);
        overrides.apply(&mut copy);

        let cloned = self
            .create(
                deadline,
                caller,
                NewConfig {
                    project_id: copy.project_id,
                    name: copy.name,
                    desc: copy.desc,
                    kind: copy.kind,
                    params: copy.params,
                },
            )
            .await?;

        tracing::info!(source = config_id, config_id = %cloned.config_id, "Cloned config");
        Ok(cloned)
    }

    /// A bundle that is already inactive is reported as not found.
    pub async fn deactivate(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        config_id: &str,
    ) -> Result<ConfigBundle> {
        let mut bundle = self.active_bundle(deadline, config_id).await?;
        require_role(self.store.as_ref(), deadline, &bundle.project_id, caller, Role::Editor)
            .await?;

        bundle.status = Status::Inactive;
        bundle.updated_at = unix_now();
        if !deadline.run(self.store.replace_active_config(bundle.clone())).await?? {
            return Err(CoreError::not_found("config", config_id));
        }

        tracing::info!(project_id = %bundle.project_id, config_id, "Deactivated config");
        self.maintainer.on_config_deactivated(bundle.clone()).await;
        Ok(bundle)
    }

    /// Returns the bundle whatever its status.
    pub async fn get(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        config_id: &str,
    ) -> Result<ConfigBundle> {
        let bundle = deadline
            .run(self.store.get_config(config_id))
            .await??
            .ok_or_else(|| CoreError::not_found("config", config_id))?;
        require_role(self.store.as_ref(), deadline, &bundle.project_id, caller, Role::Viewer)
            .await?;
        Ok(bundle)
    }

    pub async fn list(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        kind: Option<ConfigKind>,
        include_inactive: bool,
    ) -> Result<Vec<ConfigBundle>> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Viewer).await?;

        let query = ConfigQuery {
            project_id: Some(project_id.to_string()),
            kind,
            active_only: !include_inactive,
        };
        let mut bundles = deadline.run(self.store.find_configs(&query)).await??;
        bundles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(bundles)
    }

    async fn active_bundle(&self, deadline: &Deadline, config_id: &str) -> Result<ConfigBundle> {
        deadline
            .run(self.store.get_config(config_id))
            .await??
            .filter(ConfigBundle::is_active)
            .ok_or_else(|| CoreError::not_found("config", config_id))
    }

    /// Within a project, no two active bundles of the same kind share a name
    /// or identical params.
    async fn check_unique(
        &self,
        deadline: &Deadline,
        project_id: &str,
        kind: &ConfigKind,
        name: &str,
        params: &Params,
        exclude: Option<&str>,
    ) -> Result<()> {
        let query = ConfigQuery::active_in(project_id).with_kind(kind.clone());
        let existing = deadline.run(self.store.find_configs(&query)).await??;

        for other in existing
            .iter()
            .filter(|b| Some(b.config_id.as_str()) != exclude)
        {
            if other.name == name {
                return Err(CoreError::Conflict(format!(
                    "a {kind} config named {name} already exists"
                )));
            }
            if other.params == *params {
                return Err(CoreError::Conflict(format!(
                    "{} already holds these params",
                    other.config_id
                )));
            }
        }
        Ok(())
    }
}

fn check_kind_declared(project: &Project, kind: &ConfigKind) -> Result<()> {
    match kind {
        ConfigKind::Custom(name) if !project.has_active_config_type(name) => {
            Err(CoreError::Validation(format!(
                "project {} has no config type {name}",
                project.project_id
            )))
        }
        _ => Ok(()),
    }
}
