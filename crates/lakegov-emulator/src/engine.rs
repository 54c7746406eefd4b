//! Permission evaluation engine for the emulator

use crate::EmulatorState;
use lakegov_core::*;

/// Engine that evaluates permissions based on current state
#[derive(Debug, Default)]
pub struct EmulatorEngine {
    permissions: PermissionEngine,
}

impl EmulatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the engine from emulator state
    pub fn update_state(&mut self, state: &EmulatorState) {
        let mut permissions = PermissionEngine::new();
        for resource in &state.resources {
            permissions.tag_resource(resource);
        }
        for grant in &state.grants {
            permissions.grant_permission(grant.clone());
        }
        self.permissions = permissions;
    }

    /// Check if a role may perform an action on a catalog resource
    pub fn check_permission(&self, role: &str, resource: &ResourceRef, action: &Action) -> bool {
        self.permissions.check_permission(role, resource, action)
    }

    /// Grants of a role that reach a resource
    pub fn get_effective_permissions(&self, role: &str, resource: &ResourceRef) -> Vec<&PermissionGrant> {
        self.permissions
            .get_permissions_for_role(role)
            .into_iter()
            .filter(|g| self.permissions.grant_applies(g, resource))
            .collect()
    }

    /// Check permissions with detailed reasoning (for debugging)
    pub fn check_permission_with_reason(&self, role: &str, resource: &ResourceRef, action: &Action) -> (bool, String) {
        let tags = self.permissions.effective_tags(resource);
        let mut reasons = Vec::new();

        for (i, grant) in self.permissions.get_permissions_for_role(role).into_iter().enumerate() {
            let selector_match = grant.resource.covers(resource);
            let action_match = grant.allows(action);
            let conditions_match = grant.conditions_satisfied_by(&tags);

            reasons.push(format!(
                "Grant {} on {}: selector={} action={} conditions={} => {}",
                i,
                grant.resource,
                selector_match,
                action_match,
                conditions_match,
                selector_match && action_match && conditions_match
            ));

            if selector_match && action_match && conditions_match {
                return (true, reasons.join("\n"));
            }
        }

        if reasons.is_empty() {
            reasons.push(format!("role '{}' holds no grants", role));
        }
        (false, format!("DENIED:\n{}", reasons.join("\n")))
    }
}
