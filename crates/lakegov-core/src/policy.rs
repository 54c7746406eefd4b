//! Access-control compiler: group mappings to roles, grants and tag conditions

use crate::config::{Environment, GroupMapping, LakeConfig};
use crate::error::{GovernanceError, Result};
use crate::identity::IdentityDirectory;
use crate::tags::TagEngine;
use crate::types::*;
use std::collections::HashSet;

/// IAM limit on role names
const MAX_ROLE_NAME_LEN: usize = 64;

/// Wildcard accepted in `allowed_databases` and `allowed_tables`
pub const WILDCARD: &str = "*";

/// Converts every group mapping of one environment into a role, its grants
/// and their tag conditions.
///
/// Resolution is a pure function of its inputs: the same environment and
/// mappings always produce the same policy set, in input order.
pub struct PolicyResolver<'a> {
    tags: &'a TagEngine,
    directory: &'a dyn IdentityDirectory,
    provider_arn: Option<String>,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(tags: &'a TagEngine, directory: &'a dyn IdentityDirectory) -> Self {
        Self {
            tags,
            directory,
            provider_arn: None,
        }
    }

    /// Identity provider trusted by synthesized roles. Defaults to the
    /// account's `IdentityCenter` SAML provider.
    pub fn with_provider_arn(mut self, provider_arn: Option<String>) -> Self {
        self.provider_arn = provider_arn;
        self
    }

    pub fn role_name(environment: &Environment, group: &GroupMapping) -> String {
        format!("{}-{}", environment.name, group.name)
    }

    /// Resolve every mapping. Any malformed mapping aborts the whole pass;
    /// nothing is returned partially.
    pub fn resolve(&self, environment: &Environment, groups: &[GroupMapping]) -> Result<ResolvedPolicySet> {
        let mut seen = HashSet::new();
        for group in groups {
            self.check_mapping(environment, group)?;
            if !seen.insert(group.name.as_str()) {
                return Err(GovernanceError::config(format!(
                    "group '{}' is mapped twice in environment '{}'",
                    group.name, environment.name
                )));
            }
        }

        let mut policy = ResolvedPolicySet {
            environment: environment.name.clone(),
            is_production: environment.is_production,
            roles: Vec::with_capacity(groups.len()),
            grants: Vec::new(),
            tags: self.tags.tags(),
            resources: Vec::new(),
            warnings: Vec::new(),
        };

        for group in groups {
            let role = self.build_role(environment, group, &mut policy.warnings);
            let grants = Self::build_grants(environment, group, &role);
            if grants.is_empty() {
                let warning = format!(
                    "group '{}' has no allowed databases; role '{}' holds no grants",
                    group.name, role.name
                );
                tracing::warn!(environment = %environment.name, "{}", warning);
                policy.warnings.push(warning);
            }
            policy.roles.push(role);
            policy.grants.extend(grants);
        }

        tracing::info!(
            environment = %environment.name,
            roles = policy.roles.len(),
            grants = policy.grants.len(),
            "resolved access policy"
        );
        Ok(policy)
    }

    fn check_mapping(&self, environment: &Environment, group: &GroupMapping) -> Result<()> {
        let fail = |reason: String| {
            Err(GovernanceError::config(format!(
                "environment '{}', group '{}': {}",
                environment.name, group.name, reason
            )))
        };

        if group.name.trim().is_empty() {
            return fail("group name is empty".to_string());
        }
        if !group.is_data_lake_admin && group.permissions.is_empty() {
            return fail("non-admin group declares no permissions".to_string());
        }
        if Self::role_name(environment, group).len() > MAX_ROLE_NAME_LEN {
            return fail(format!("role name exceeds {} characters", MAX_ROLE_NAME_LEN));
        }

        if group.category == GroupCategory::Infrastructure {
            if group.is_data_lake_admin {
                return fail("infrastructure groups cannot be data-lake administrators".to_string());
            }
            if let Some(verb) = group.permissions.iter().find(|a| a.is_data_verb()) {
                return fail(format!("infrastructure groups cannot hold data verb {}", verb));
            }
        }

        for tenant in &group.tenants {
            if self.tags.validate_value(TagKey::TenantId, tenant).is_err() {
                return fail(format!("tenant '{}' is not an allowed TenantID value", tenant));
            }
        }

        for database in &group.allowed_databases {
            if database.trim().is_empty() {
                return fail("empty database name".to_string());
            }
        }
        let named_tables = group.allowed_tables.iter().any(|t| t != WILDCARD);
        if named_tables && group.allowed_databases.iter().any(|d| d == WILDCARD) {
            return fail("a wildcard database cannot be combined with named tables".to_string());
        }
        Ok(())
    }

    fn build_role(&self, environment: &Environment, group: &GroupMapping, warnings: &mut Vec<String>) -> Role {
        let name = Self::role_name(environment, group);

        let trust = match self.directory.group_id(&group.name) {
            Some(group_id) => Some(TrustCondition {
                provider_arn: self.provider_arn.clone().unwrap_or_else(|| {
                    format!("arn:aws:iam::{}:saml-provider/IdentityCenter", environment.account_id)
                }),
                group_ids: vec![group_id],
            }),
            None => {
                let warning = format!(
                    "group '{}' has no directory id yet; role '{}' is emitted without a trust condition",
                    group.name, name
                );
                tracing::warn!(environment = %environment.name, "{}", warning);
                warnings.push(warning);
                None
            }
        };

        Role {
            arn: format!("arn:aws:iam::{}:role/{}", environment.account_id, name),
            name,
            group_name: group.name.clone(),
            category: group.category,
            exclude_phi: group.exclude_phi,
            is_data_lake_admin: group.is_data_lake_admin,
            tenants: group.tenants.clone(),
            trust,
            max_session_duration_secs: environment.max_session_duration_secs,
        }
    }

    fn build_grants(environment: &Environment, group: &GroupMapping, role: &Role) -> Vec<PermissionGrant> {
        let (actions, grant_option) = Self::verbs(environment, group);
        let conditions = Self::conditions(group);

        Self::selectors(group)
            .into_iter()
            .map(|resource| PermissionGrant {
                role: role.name.clone(),
                resource,
                actions: actions.clone(),
                tag_conditions: conditions.clone(),
                grant_option,
            })
            .collect()
    }

    /// Verb set and grant option for a group.
    ///
    /// Non-production environments broaden data-engineering groups that are
    /// kept away from PHI to `ALL`. Production only ever grants what the
    /// configuration spells out.
    fn verbs(environment: &Environment, group: &GroupMapping) -> (Vec<Action>, bool) {
        if group.is_data_lake_admin {
            return (Action::ADMIN_SET.to_vec(), true);
        }

        if !environment.is_production
            && group.category == GroupCategory::DataEngineering
            && group.exclude_phi
        {
            tracing::debug!(group = %group.name, "non-production data-engineering group broadened to ALL");
            return (vec![Action::All], false);
        }

        let mut verbs = Vec::with_capacity(group.permissions.len());
        for action in &group.permissions {
            if !verbs.contains(action) {
                verbs.push(*action);
            }
        }
        (verbs, false)
    }

    fn selectors(group: &GroupMapping) -> Vec<Resource> {
        if group.allowed_databases.iter().any(|d| d == WILDCARD) {
            return vec![Resource::Catalog];
        }

        let all_tables = group.allowed_tables.iter().any(|t| t == WILDCARD);
        let mut selectors: Vec<Resource> = Vec::new();
        for database in &group.allowed_databases {
            let produced = if group.allowed_tables.is_empty() {
                vec![Resource::Database { name: database.clone() }]
            } else if all_tables {
                vec![Resource::TableWildcard { database: database.clone() }]
            } else {
                group
                    .allowed_tables
                    .iter()
                    .map(|table| Resource::Table {
                        database: database.clone(),
                        table: table.clone(),
                    })
                    .collect()
            };
            for selector in produced {
                if !selectors.contains(&selector) {
                    selectors.push(selector);
                }
            }
        }
        selectors
    }

    /// Conditions attached to every grant of the group. They are only ever
    /// added, never relaxed by a later step.
    fn conditions(group: &GroupMapping) -> Vec<TagCondition> {
        let mut conditions = Vec::new();
        if group.exclude_phi {
            conditions.push(TagCondition::phi_excluded());
        }
        if !group.tenants.is_empty() {
            conditions.push(TagCondition::tenant_in(&group.tenants));
        }
        conditions
    }
}

/// Classify an environment's catalog and resolve its group mappings.
///
/// Every catalog entry is tagged independently; if any of them fails, all
/// failures are reported together and nothing is resolved.
pub fn resolve_environment(config: &LakeConfig, environment_name: &str) -> Result<ResolvedPolicySet> {
    let env_config = config.environment(environment_name)?;
    let environment = env_config.environment();
    let tags = TagEngine::for_environment(config, &environment)?;

    let mut resources = Vec::with_capacity(env_config.catalog.len());
    let mut failures = Vec::new();
    for entry in &env_config.catalog {
        match tags.tag_catalog_entry(entry, &environment.name) {
            Ok(tagged) => resources.push(tagged),
            Err(e) => {
                tracing::error!(database = %entry.database, table = ?entry.table, error = %e, "failed to classify catalog entry");
                failures.push(e.to_string());
            }
        }
    }
    if !failures.is_empty() {
        return Err(GovernanceError::config(format!(
            "catalog classification failed: {}",
            failures.join("; ")
        )));
    }

    let directory = config.directory();
    let mut policy = PolicyResolver::new(&tags, &directory)
        .with_provider_arn(config.identity.provider_arn.clone())
        .resolve(&environment, &env_config.groups)?;
    policy.resources = resources;
    Ok(policy)
}
