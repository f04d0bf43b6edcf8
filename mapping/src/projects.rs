//! Project lifecycle, as far as authorization and cascades need it.

use crate::access::require_role;
use crate::consistency::ConsistencyMaintainer;
use crate::errors::{CoreError, Result};
use crate::store::Store;
use crate::types::{
    APP_CONFIG_TYPE, Caller, CompanyId, ConfigType, PLAYER_CONFIG_TYPE, Project, ProjectEnv, Role,
    Status, unix_now,
};
use serde::Deserialize;
use shared::deadline::Deadline;
use shared::ids::generate_id;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NewProject {
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub env: ProjectEnv,
}

#[derive(Clone)]
pub struct ProjectService {
    store: Arc<dyn Store>,
    maintainer: ConsistencyMaintainer,
}

impl ProjectService {
    pub fn new(store: Arc<dyn Store>, maintainer: ConsistencyMaintainer) -> Self {
        ProjectService { store, maintainer }
    }

    /// The caller becomes the project's first owner.
    pub async fn create_project(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        new: NewProject,
    ) -> Result<Project> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("project name is required".into()));
        }
        if new.company_id.trim().is_empty() {
            return Err(CoreError::Validation("company_id is required".into()));
        }

        let siblings = deadline
            .run(self.store.find_projects(&new.company_id))
            .await??;
        if siblings.iter().any(|p| p.status.is_active() && p.name == name) {
            return Err(CoreError::Conflict(format!(
                "company {} already has a project named {name}",
                new.company_id
            )));
        }

        let now = unix_now();
        let project = Project {
            project_id: generate_id(name),
            company_id: new.company_id,
            name: name.to_string(),
            env: new.env,
            status: Status::Active,
            owners: vec![caller.email.clone()],
            editors: Vec::new(),
            viewers: Vec::new(),
            config_types: ConfigType::builtin(),
            created_at: now,
            updated_at: now,
        };
        deadline
            .run(self.store.insert_project(project.clone()))
            .await??;

        tracing::info!(
            project_id = %project.project_id,
            company_id = %project.company_id,
            "Created project"
        );
        Ok(project)
    }

    pub async fn get_project(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
    ) -> Result<Project> {
        require_role(self.store.as_ref(), deadline, project_id, caller, Role::Viewer).await
    }

    /// Grants `role` to `email`, replacing any role it held before.
    pub async fn add_member(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        email: &str,
        role: Role,
    ) -> Result<Project> {
        let mut project =
            require_role(self.store.as_ref(), deadline, project_id, caller, Role::Owner).await?;
        let email = email.trim();
        if email.is_empty() {
            return Err(CoreError::Validation("member email is required".into()));
        }

        for held in [Role::Owner, Role::Editor, Role::Viewer] {
            project.members_mut(held).retain(|member| member != email);
        }
        if project.owners.is_empty() {
            return Err(CoreError::Validation(format!(
                "project {project_id} must keep at least one owner"
            )));
        }
        project.members_mut(role).push(email.to_string());

        self.save(deadline, project).await
    }

    /// Declares a custom config type. A previously removed type of the same
    /// name is reactivated.
    pub async fn add_config_type(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        name: &str,
        desc: &str,
    ) -> Result<Project> {
        let mut project =
            require_role(self.store.as_ref(), deadline, project_id, caller, Role::Owner).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("config type name is required".into()));
        }
        if project.has_active_config_type(name) {
            return Err(CoreError::Conflict(format!(
                "config type {name} already exists"
            )));
        }

        match project.config_types.iter_mut().find(|t| t.name == name) {
            Some(existing) => {
                existing.status = Status::Active;
                existing.desc = desc.to_string();
            }
            None => project.config_types.push(ConfigType::new(name, desc)),
        }

        tracing::info!(project_id, config_type = name, "Added config type");
        self.save(deadline, project).await
    }

    /// Removes a custom config type and cascades to its bundles and the
    /// mappings carrying them.
    pub async fn remove_config_type(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
        name: &str,
    ) -> Result<Project> {
        if name == APP_CONFIG_TYPE || name == PLAYER_CONFIG_TYPE {
            return Err(CoreError::Validation(format!(
                "built-in config type {name} cannot be removed"
            )));
        }

        let mut project =
            require_role(self.store.as_ref(), deadline, project_id, caller, Role::Owner).await?;
        let config_type = project
            .config_types
            .iter_mut()
            .find(|t| t.name == name && t.status.is_active())
            .ok_or_else(|| CoreError::not_found("config type", name))?;
        config_type.status = Status::Inactive;

        let project = self.save(deadline, project).await?;
        tracing::info!(project_id, config_type = name, "Removed config type");
        self.maintainer.on_config_type_removed(project_id, name).await;
        Ok(project)
    }

    pub async fn deactivate_project(
        &self,
        deadline: &Deadline,
        caller: &Caller,
        project_id: &str,
    ) -> Result<Project> {
        let mut project =
            require_role(self.store.as_ref(), deadline, project_id, caller, Role::Owner).await?;
        project.status = Status::Inactive;

        let project = self.save(deadline, project).await?;
        tracing::info!(project_id, "Deactivated project");
        self.maintainer.on_project_deactivated(project_id).await;
        Ok(project)
    }

    async fn save(&self, deadline: &Deadline, mut project: Project) -> Result<Project> {
        project.updated_at = unix_now();
        if !deadline
            .run(self.store.replace_project(project.clone()))
            .await??
        {
            return Err(CoreError::not_found("project", &project.project_id));
        }
        Ok(project)
    }
}
