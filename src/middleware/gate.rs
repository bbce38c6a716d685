use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use tracing::warn;

use crate::app::AppState;
use crate::error::ApiError;
use crate::types::{Actor, Capability};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

/// Authorization decision point in front of the migration API
pub trait CapabilityGate: Send + Sync {
    fn authorize(&self, actor: &Actor, required: &[Capability]) -> Decision;
}

/// Grants capabilities by role name
#[derive(Debug, Clone)]
pub struct RoleGate {
    grants: HashMap<String, Vec<Capability>>,
}

impl RoleGate {
    pub fn new() -> Self {
        Self {
            grants: HashMap::new(),
        }
    }

    pub fn grant(mut self, role: &str, capabilities: &[Capability]) -> Self {
        self.grants
            .entry(role.to_string())
            .or_default()
            .extend_from_slice(capabilities);
        self
    }
}

impl Default for RoleGate {
    /// Only super admins may move tenants between datastores
    fn default() -> Self {
        Self::new().grant("super_admin", &[Capability::MigrateTenants])
    }
}

impl CapabilityGate for RoleGate {
    fn authorize(&self, actor: &Actor, required: &[Capability]) -> Decision {
        let granted = actor
            .role
            .as_deref()
            .and_then(|role| self.grants.get(role))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        match required.iter().find(|cap| !granted.contains(cap)) {
            None => Decision::Allow,
            Some(missing) => Decision::Deny(format!("Missing capability {:?}", missing)),
        }
    }
}

/// Rejects callers whose actor lacks `MigrateTenants`. Runs after JWT auth.
pub async fn require_migrate_capability(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let actor = request
        .extensions()
        .get::<Actor>()
        .cloned()
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    match state.gate.authorize(&actor, &[Capability::MigrateTenants]) {
        Decision::Allow => Ok(next.run(request).await),
        Decision::Deny(reason) => {
            warn!(
                "Denied migration access for {}: {}",
                actor.id.as_deref().unwrap_or("anonymous"),
                reason
            );
            Err(ApiError::forbidden("Super admin access required"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: Option<&str>) -> Actor {
        Actor {
            id: Some("u1".into()),
            role: role.map(str::to_string),
        }
    }

    #[test]
    fn only_super_admin_may_migrate() {
        let gate = RoleGate::default();
        assert_eq!(
            gate.authorize(&actor(Some("super_admin")), &[Capability::MigrateTenants]),
            Decision::Allow
        );
        assert!(matches!(
            gate.authorize(&actor(Some("admin")), &[Capability::MigrateTenants]),
            Decision::Deny(_)
        ));
        assert!(matches!(
            gate.authorize(&actor(None), &[Capability::MigrateTenants]),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn extra_roles_can_be_granted() {
        let gate = RoleGate::default().grant("platform_ops", &[Capability::MigrateTenants]);
        assert_eq!(
            gate.authorize(&actor(Some("platform_ops")), &[Capability::MigrateTenants]),
            Decision::Allow
        );
    }
}
