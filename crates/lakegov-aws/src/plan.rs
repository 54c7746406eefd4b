//! Translation of resolved grants into Lake Formation grant calls.
//!
//! Lake Formation attaches tag conditions only to LF-tag policy grants, and
//! those cannot name a database. Catalog-wide grants therefore become tag
//! expressions. Named selectors that carry conditions are expanded to the
//! classified resources whose tags satisfy them; unclassified resources are
//! never granted.

use aws_sdk_lakeformation::types::Permission as LfPermission;
use lakegov_core::*;
use std::collections::BTreeMap;

/// Which catalog objects an LF-tag expression grant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionScope {
    Database,
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantTarget {
    Database(String),
    /// Every current and future table of a database
    AllTables(String),
    Table { database: String, table: String },
    TagExpression {
        scope: ExpressionScope,
        expression: Vec<(TagKey, Vec<String>)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedGrant {
    pub target: GrantTarget,
    pub permissions: Vec<LfPermission>,
    pub grantable: Vec<LfPermission>,
}

fn collapse(mut permissions: Vec<LfPermission>) -> Vec<LfPermission> {
    if permissions.contains(&LfPermission::All) {
        return vec![LfPermission::All];
    }
    let mut unique = Vec::with_capacity(permissions.len());
    for permission in permissions.drain(..) {
        if !unique.contains(&permission) {
            unique.push(permission);
        }
    }
    unique
}

/// Verbs that apply to a database object
pub fn database_permissions(actions: &[Action]) -> Vec<LfPermission> {
    collapse(
        actions
            .iter()
            .filter_map(|action| match action {
                Action::All => Some(LfPermission::All),
                Action::CreateTable => Some(LfPermission::CreateTable),
                Action::Alter => Some(LfPermission::Alter),
                Action::Drop => Some(LfPermission::Drop),
                Action::Describe => Some(LfPermission::Describe),
                _ => None,
            })
            .collect(),
    )
}

/// Verbs that apply to a table object
pub fn table_permissions(actions: &[Action]) -> Vec<LfPermission> {
    collapse(
        actions
            .iter()
            .filter_map(|action| match action {
                Action::All => Some(LfPermission::All),
                Action::Select => Some(LfPermission::Select),
                Action::Insert => Some(LfPermission::Insert),
                Action::Update => Some(LfPermission::Insert), // Lake Formation doesn't have UPDATE
                Action::Delete => Some(LfPermission::Delete),
                Action::Describe => Some(LfPermission::Describe),
                Action::Alter => Some(LfPermission::Alter),
                Action::Drop => Some(LfPermission::Drop),
                _ => None,
            })
            .collect(),
    )
}

/// LF-tag expression equivalent to a condition list.
///
/// Always pinned to the deploying environment's Environment value. The
/// catalog may be shared, so other environments' values stay out even when
/// the LF-tag defines them. Returns `None` when no value can match.
pub fn tag_expression(
    conditions: &[TagCondition],
    environment: &str,
    defined: &BTreeMap<TagKey, Vec<String>>,
) -> Option<Vec<(TagKey, Vec<String>)>> {
    if !defined.get(&TagKey::Environment)?.iter().any(|v| v == environment) {
        return None;
    }
    let mut expression: BTreeMap<TagKey, Vec<String>> = BTreeMap::new();
    expression.insert(TagKey::Environment, vec![environment.to_string()]);

    for condition in conditions {
        let allowed: Vec<String> = match condition {
            TagCondition::NotEquals { key, value } => defined
                .get(key)?
                .iter()
                .filter(|v| *v != value)
                .cloned()
                .collect(),
            TagCondition::In { values, .. } => values.clone(),
        };
        let entry = expression.entry(condition.key()).or_insert_with(|| allowed.clone());
        entry.retain(|v| allowed.contains(v));
        if entry.is_empty() {
            return None;
        }
    }

    Some(expression.into_iter().collect())
}

fn push(planned: &mut Vec<PlannedGrant>, target: GrantTarget, permissions: Vec<LfPermission>, grant_option: bool) {
    if permissions.is_empty() {
        return;
    }
    let grantable = if grant_option { permissions.clone() } else { Vec::new() };
    planned.push(PlannedGrant {
        target,
        permissions,
        grantable,
    });
}

/// Lake Formation calls needed for one resolved grant
pub fn plan_grant(
    grant: &PermissionGrant,
    environment: &str,
    known: &PermissionEngine,
    defined: &BTreeMap<TagKey, Vec<String>>,
) -> Vec<PlannedGrant> {
    let database_perms = database_permissions(&grant.actions);
    let table_perms = table_permissions(&grant.actions);
    let mut planned = Vec::new();

    match (&grant.resource, grant.tag_conditions.is_empty()) {
        (Resource::Catalog, _) => {
            if let Some(expression) = tag_expression(&grant.tag_conditions, environment, defined) {
                push(
                    &mut planned,
                    GrantTarget::TagExpression {
                        scope: ExpressionScope::Database,
                        expression: expression.clone(),
                    },
                    database_perms,
                    grant.grant_option,
                );
                push(
                    &mut planned,
                    GrantTarget::TagExpression {
                        scope: ExpressionScope::Table,
                        expression,
                    },
                    table_perms,
                    grant.grant_option,
                );
            }
        }
        (Resource::Database { name }, true) => {
            push(&mut planned, GrantTarget::Database(name.clone()), database_perms, grant.grant_option);
            push(&mut planned, GrantTarget::AllTables(name.clone()), table_perms, grant.grant_option);
        }
        (Resource::TableWildcard { database }, true) => {
            push(&mut planned, GrantTarget::AllTables(database.clone()), table_perms, grant.grant_option);
        }
        (Resource::Table { database, table }, true) => {
            push(
                &mut planned,
                GrantTarget::Table {
                    database: database.clone(),
                    table: table.clone(),
                },
                table_perms,
                grant.grant_option,
            );
        }
        (_, false) => {
            for resource in known.reachable_resources(grant) {
                match &resource.table {
                    None => push(
                        &mut planned,
                        GrantTarget::Database(resource.database.clone()),
                        database_perms.clone(),
                        grant.grant_option,
                    ),
                    Some(table) => push(
                        &mut planned,
                        GrantTarget::Table {
                            database: resource.database.clone(),
                            table: table.clone(),
                        },
                        table_perms.clone(),
                        grant.grant_option,
                    ),
                }
            }
        }
    }

    planned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defined() -> BTreeMap<TagKey, Vec<String>> {
        let mut defined = BTreeMap::new();
        defined.insert(TagKey::Environment, vec!["dev".to_string()]);
        defined.insert(TagKey::Phi, vec!["true".to_string(), "false".to_string()]);
        defined.insert(
            TagKey::TenantId,
            vec!["tenant-a".to_string(), "tenant-b".to_string(), "multi-tenant".to_string()],
        );
        defined
    }

    fn known() -> PermissionEngine {
        let mut engine = PermissionEngine::new();
        for (resource, phi) in [
            (ResourceRef::database("clinical"), "false"),
            (ResourceRef::table("clinical", "patients"), "true"),
            (ResourceRef::table("clinical", "encounters"), "false"),
        ] {
            engine.tag_resource(&TaggedResource {
                resource,
                tags: [(TagKey::Environment, "dev".to_string()), (TagKey::Phi, phi.to_string())]
                    .into_iter()
                    .collect(),
            });
        }
        engine
    }

    fn grant(resource: Resource, actions: &[Action], conditions: Vec<TagCondition>) -> PermissionGrant {
        PermissionGrant {
            role: "dev-analysts".to_string(),
            resource,
            actions: actions.to_vec(),
            tag_conditions: conditions,
            grant_option: false,
        }
    }

    #[test]
    fn test_permission_split() {
        assert_eq!(
            database_permissions(&Action::ADMIN_SET),
            vec![
                LfPermission::CreateTable,
                LfPermission::Alter,
                LfPermission::Drop,
                LfPermission::Describe
            ]
        );
        assert_eq!(
            table_permissions(&[Action::Select, Action::Update, Action::Insert]),
            vec![LfPermission::Select, LfPermission::Insert]
        );
        assert_eq!(table_permissions(&[Action::All, Action::Select]), vec![LfPermission::All]);
    }

    #[test]
    fn test_phi_exclusion_becomes_complement() {
        let expression = tag_expression(&[TagCondition::phi_excluded()], "dev", &defined()).unwrap();
        assert_eq!(
            expression,
            vec![
                (TagKey::Environment, vec!["dev".to_string()]),
                (TagKey::Phi, vec!["false".to_string()]),
            ]
        );
    }

    #[test]
    fn test_shared_catalog_expression_stays_in_environment() {
        let mut shared = defined();
        shared.insert(TagKey::Environment, vec!["dev".to_string(), "prod".to_string()]);

        let expression = tag_expression(&[TagCondition::phi_excluded()], "dev", &shared).unwrap();
        assert_eq!(expression[0], (TagKey::Environment, vec!["dev".to_string()]));

        let broadened = grant(Resource::Catalog, &[Action::All], vec![TagCondition::phi_excluded()]);
        let planned = plan_grant(&broadened, "dev", &known(), &shared);
        assert!(!planned.is_empty());
        for plan in &planned {
            match &plan.target {
                GrantTarget::TagExpression { expression, .. } => {
                    assert_eq!(expression[0], (TagKey::Environment, vec!["dev".to_string()]));
                }
                other => panic!("unexpected target {:?}", other),
            }
        }

        assert!(tag_expression(&[], "qa", &shared).is_none());
    }

    #[test]
    fn test_unsatisfiable_expression() {
        let conditions = [TagCondition::tenant_in(&["tenant-z".to_string()])];
        let expression = tag_expression(&conditions, "dev", &defined()).unwrap();
        assert_eq!(expression[1], (TagKey::TenantId, vec!["tenant-z".to_string()]));

        let mut narrowed = defined();
        narrowed.insert(TagKey::Phi, vec!["true".to_string()]);
        assert!(tag_expression(&[TagCondition::phi_excluded()], "dev", &narrowed).is_none());
        assert!(tag_expression(&[], "dev", &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_catalog_grant_uses_tag_policies() {
        let planned = plan_grant(
            &grant(Resource::Catalog, &[Action::Select, Action::Describe], vec![TagCondition::phi_excluded()]),
            "dev",
            &known(),
            &defined(),
        );
        assert_eq!(planned.len(), 2);
        assert!(matches!(
            planned[0].target,
            GrantTarget::TagExpression { scope: ExpressionScope::Database, .. }
        ));
        assert_eq!(planned[0].permissions, vec![LfPermission::Describe]);
        assert_eq!(planned[1].permissions, vec![LfPermission::Select, LfPermission::Describe]);
    }

    #[test]
    fn test_unconditioned_database_grant() {
        let planned = plan_grant(
            &grant(Resource::Database { name: "clinical".to_string() }, &[Action::Select], vec![]),
            "dev",
            &known(),
            &defined(),
        );
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].target, GrantTarget::AllTables("clinical".to_string()));
    }

    #[test]
    fn test_conditioned_database_grant_skips_phi_tables() {
        let planned = plan_grant(
            &grant(
                Resource::Database { name: "clinical".to_string() },
                &[Action::Select, Action::Describe],
                vec![TagCondition::phi_excluded()],
            ),
            "dev",
            &known(),
            &defined(),
        );
        let targets: Vec<&GrantTarget> = planned.iter().map(|p| &p.target).collect();
        assert_eq!(
            targets,
            vec![
                &GrantTarget::Database("clinical".to_string()),
                &GrantTarget::Table {
                    database: "clinical".to_string(),
                    table: "encounters".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_grant_option_is_carried() {
        let mut admin = grant(Resource::Database { name: "clinical".to_string() }, &Action::ADMIN_SET, vec![]);
        admin.grant_option = true;
        let planned = plan_grant(&admin, "dev", &known(), &defined());
        assert!(planned.iter().all(|p| p.grantable == p.permissions));
    }
}
