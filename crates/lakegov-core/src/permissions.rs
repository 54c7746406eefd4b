//! Effective-permission evaluation over tagged catalog resources

use crate::types::*;
use std::collections::BTreeMap;

/// Permission evaluation engine.
///
/// Tables inherit their database's tags unless they override them, the way
/// the catalog propagates classification tags.
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    /// All granted permissions
    grants: Vec<PermissionGrant>,
    /// Known catalog resources and their own (not inherited) tags
    resources: BTreeMap<ResourceRef, BTreeMap<TagKey, String>>,
}

fn normalize(resource: &ResourceRef) -> ResourceRef {
    ResourceRef {
        catalog_id: None,
        database: resource.database.clone(),
        table: resource.table.clone(),
    }
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policy(policy: &ResolvedPolicySet) -> Self {
        let mut engine = Self::new();
        for resource in &policy.resources {
            engine.tag_resource(resource);
        }
        engine.grants = policy.grants.clone();
        engine
    }

    /// Grant a permission, replacing any earlier grant for the same
    /// role and selector
    pub fn grant_permission(&mut self, grant: PermissionGrant) {
        self.grants
            .retain(|g| !(g.role == grant.role && g.resource == grant.resource));
        self.grants.push(grant);
    }

    /// Record (or overwrite) the tags of a resource
    pub fn tag_resource(&mut self, resource: &TaggedResource) {
        self.resources
            .entry(normalize(&resource.resource))
            .or_default()
            .extend(resource.tags.iter().map(|(k, v)| (*k, v.clone())));
    }

    /// Database tags overlaid with the resource's own tags
    pub fn effective_tags(&self, resource: &ResourceRef) -> BTreeMap<TagKey, String> {
        let key = normalize(resource);
        let mut tags = BTreeMap::new();
        if key.table.is_some() {
            if let Some(db_tags) = self.resources.get(&key.parent_database()) {
                tags.extend(db_tags.iter().map(|(k, v)| (*k, v.clone())));
            }
        }
        if let Some(own) = self.resources.get(&key) {
            tags.extend(own.iter().map(|(k, v)| (*k, v.clone())));
        }
        tags
    }

    /// Whether a grant reaches a concrete resource: the selector covers it
    /// and every tag condition holds on its effective tags
    pub fn grant_applies(&self, grant: &PermissionGrant, resource: &ResourceRef) -> bool {
        if !grant.resource.covers(resource) {
            return false;
        }
        grant.tag_conditions.is_empty() || grant.conditions_satisfied_by(&self.effective_tags(resource))
    }

    /// Check if a role may perform an action on a resource
    pub fn check_permission(&self, role: &str, resource: &ResourceRef, action: &Action) -> bool {
        self.grants
            .iter()
            .any(|g| g.role == role && g.allows(action) && self.grant_applies(g, resource))
    }

    /// Known resources a grant reaches
    pub fn reachable_resources<'a>(&'a self, grant: &'a PermissionGrant) -> impl Iterator<Item = &'a ResourceRef> + 'a {
        self.resources
            .keys()
            .filter(move |resource| self.grant_applies(grant, resource))
    }

    pub fn is_phi(&self, resource: &ResourceRef) -> bool {
        self.effective_tags(resource).get(&TagKey::Phi).map(String::as_str) == Some("true")
    }

    pub fn get_permissions_for_role(&self, role: &str) -> Vec<&PermissionGrant> {
        self.grants.iter().filter(|g| g.role == role).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(resource: ResourceRef, pairs: &[(TagKey, &str)]) -> TaggedResource {
        TaggedResource {
            resource,
            tags: pairs.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }

    fn engine() -> PermissionEngine {
        let mut engine = PermissionEngine::new();
        engine.tag_resource(&tagged(
            ResourceRef::database("clinical"),
            &[(TagKey::Environment, "dev"), (TagKey::Phi, "false")],
        ));
        engine.tag_resource(&tagged(
            ResourceRef::table("clinical", "patients"),
            &[(TagKey::Phi, "true")],
        ));
        engine
    }

    #[test]
    fn test_table_overrides_database_tags() {
        let engine = engine();
        assert!(engine.is_phi(&ResourceRef::table("clinical", "patients")));
        assert!(!engine.is_phi(&ResourceRef::table("clinical", "encounters")));
        assert_eq!(
            engine
                .effective_tags(&ResourceRef::table("clinical", "patients"))
                .get(&TagKey::Environment)
                .map(String::as_str),
            Some("dev")
        );
    }

    #[test]
    fn test_phi_condition_blocks_phi_table() {
        let mut engine = engine();
        engine.grant_permission(PermissionGrant {
            role: "dev-analysts".to_string(),
            resource: Resource::Catalog,
            actions: vec![Action::Select],
            tag_conditions: vec![TagCondition::phi_excluded()],
            grant_option: false,
        });

        assert!(engine.check_permission(
            "dev-analysts",
            &ResourceRef::table("clinical", "encounters"),
            &Action::Select
        ));
        assert!(!engine.check_permission(
            "dev-analysts",
            &ResourceRef::table("clinical", "patients"),
            &Action::Select
        ));
        assert!(!engine.check_permission(
            "dev-analysts",
            &ResourceRef::table("clinical", "encounters"),
            &Action::Delete
        ));
    }

    #[test]
    fn test_regrant_replaces() {
        let mut engine = engine();
        let mut grant = PermissionGrant {
            role: "dev-eng".to_string(),
            resource: Resource::Database { name: "clinical".to_string() },
            actions: vec![Action::Select],
            tag_conditions: vec![],
            grant_option: false,
        };
        engine.grant_permission(grant.clone());
        grant.actions = vec![Action::Describe];
        engine.grant_permission(grant);

        assert_eq!(engine.get_permissions_for_role("dev-eng").len(), 1);
        assert!(!engine.check_permission(
            "dev-eng",
            &ResourceRef::table("clinical", "patients"),
            &Action::Select
        ));
    }

    #[test]
    fn test_reachable_resources() {
        let engine = engine();
        let grant = PermissionGrant {
            role: "dev-analysts".to_string(),
            resource: Resource::TableWildcard { database: "clinical".to_string() },
            actions: vec![Action::Select],
            tag_conditions: vec![],
            grant_option: false,
        };
        let reached: Vec<String> = engine.reachable_resources(&grant).map(|r| r.to_string()).collect();
        assert_eq!(reached, vec!["clinical.patients"]);
    }
}
