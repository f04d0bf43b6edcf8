//! Authorization checks run before any write.

use crate::errors::{CoreError, Result};
use crate::store::Store;
use crate::types::{Caller, Project, Role};
use sha2::{Digest, Sha256};
use shared::deadline::Deadline;
use std::time::{SystemTime, UNIX_EPOCH};

/// Loads an active project and checks that `caller` holds at least `required`.
pub async fn require_role(
    store: &dyn Store,
    deadline: &Deadline,
    project_id: &str,
    caller: &Caller,
    required: Role,
) -> Result<Project> {
    let project = deadline
        .run(store.get_project(project_id))
        .await??
        .filter(|p| p.status.is_active())
        .ok_or_else(|| CoreError::not_found("project", project_id))?;

    match project.role_of(&caller.email) {
        Some(role) if role >= required => Ok(project),
        _ => Err(CoreError::Unauthorized(format!(
            "{} requires the {required} role on project {project_id}",
            caller.email
        ))),
    }
}

/// Number of nonces a client may append to the time salt.
const CLIENT_HASH_NONCES: u32 = 10;

/// Checks a resolve client's `x-client-hash`.
///
/// A valid hash is the hex SHA-256 of `{salt}{hour}{minute}{n}`, where hour and
/// minute are the current UTC time without zero padding and `n` is in `0..=9`.
pub fn verify_client_hash(salt: &str, presented: &str, now: SystemTime) -> bool {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let hour = (secs / 3600) % 24;
    let minute = (secs / 60) % 60;

    (0..CLIENT_HASH_NONCES).any(|n| {
        let digest = Sha256::digest(format!("{salt}{hour}{minute}{n}").as_bytes());
        hex::encode(digest).eq_ignore_ascii_case(presented)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutils::{OWNER, STRANGER, VIEWER, test_project};
    use std::time::Duration;

    #[tokio::test]
    async fn test_require_role() {
        let store = MemoryStore::new();
        let project = test_project();
        store.insert_project(project.clone()).await.unwrap();
        let deadline = Deadline::none();

        let found = require_role(
            &store,
            &deadline,
            &project.project_id,
            &Caller::new(OWNER),
            Role::Owner,
        )
        .await
        .unwrap();
        assert_eq!(found.project_id, project.project_id);

        let err = require_role(
            &store,
            &deadline,
            &project.project_id,
            &Caller::new(VIEWER),
            Role::Editor,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let err = require_role(
            &store,
            &deadline,
            &project.project_id,
            &Caller::new(STRANGER),
            Role::Viewer,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let err = require_role(&store, &deadline, "missing", &Caller::new(OWNER), Role::Viewer)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::not_found("project", "missing"));
    }

    #[test]
    fn test_verify_client_hash() {
        // 1970-01-01 05:07:00 UTC
        let now = UNIX_EPOCH + Duration::from_secs(5 * 3600 + 7 * 60);
        let valid = hex::encode(Sha256::digest(b"pepper573"));

        assert!(verify_client_hash("pepper", &valid, now));
        assert!(verify_client_hash("pepper", &valid.to_uppercase(), now));
        assert!(!verify_client_hash("salt", &valid, now));
        assert!(!verify_client_hash(
            "pepper",
            &valid,
            now + Duration::from_secs(60)
        ));
    }
}
