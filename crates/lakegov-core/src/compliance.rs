//! Compliance checks over a resolved policy set.
//!
//! Every check always runs and always appears in the report, so a single
//! report lists every violation. A failing check is a finding, not an
//! error; only a structurally broken policy set is rejected.
//!
//! Advisory checks report findings without affecting compliance. A group
//! whose directory id has not synced yet is a warning, not a violation.

use crate::error::{GovernanceError, Result};
use crate::permissions::PermissionEngine;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The fixed battery of checks, in report order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComplianceCheck {
    PhiExclusion,
    InfrastructureDataDenial,
    TenantTagMembership,
    TenantIsolation,
    RequiredResourceTags,
    FederatedTrust,
}

impl ComplianceCheck {
    pub const ALL: [ComplianceCheck; 6] = [
        ComplianceCheck::PhiExclusion,
        ComplianceCheck::InfrastructureDataDenial,
        ComplianceCheck::TenantTagMembership,
        ComplianceCheck::TenantIsolation,
        ComplianceCheck::RequiredResourceTags,
        ComplianceCheck::FederatedTrust,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ComplianceCheck::PhiExclusion => "phi-exclusion",
            ComplianceCheck::InfrastructureDataDenial => "infrastructure-data-denial",
            ComplianceCheck::TenantTagMembership => "tenant-tag-membership",
            ComplianceCheck::TenantIsolation => "tenant-isolation",
            ComplianceCheck::RequiredResourceTags => "required-resource-tags",
            ComplianceCheck::FederatedTrust => "federated-trust",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ComplianceCheck::PhiExclusion => "Roles excluded from PHI cannot reach PHI=true resources",
            ComplianceCheck::InfrastructureDataDenial => "Infrastructure roles hold no data verbs",
            ComplianceCheck::TenantTagMembership => "Every TenantID in a grant is an allowed TenantID value",
            ComplianceCheck::TenantIsolation => "Tenant-scoped roles only reach their own tenants",
            ComplianceCheck::RequiredResourceTags => "Every tagged resource carries Environment and PHI",
            ComplianceCheck::FederatedTrust => "Every role is assumable only through federated group membership",
        }
    }

    /// Findings are reported but never gate a deployment
    pub fn is_advisory(&self) -> bool {
        matches!(self, ComplianceCheck::FederatedTrust)
    }

    fn run(&self, policy: &ResolvedPolicySet, engine: &PermissionEngine) -> Vec<ComplianceFinding> {
        let finding = |role: Option<&str>, resource: Option<String>, message: String| ComplianceFinding {
            check: self.name().to_string(),
            role: role.map(str::to_string),
            resource,
            message,
        };
        let mut findings = Vec::new();

        match self {
            ComplianceCheck::PhiExclusion => {
                for role in policy.roles.iter().filter(|r| r.exclude_phi) {
                    for grant in policy.grants_for(&role.name) {
                        if !grant.excludes_phi() {
                            findings.push(finding(
                                Some(role.name.as_str()),
                                Some(grant.resource.to_string()),
                                "grant is missing the PHI != 'true' condition".to_string(),
                            ));
                        }
                        for resource in engine.reachable_resources(grant).filter(|r| engine.is_phi(r)) {
                            findings.push(finding(
                                Some(role.name.as_str()),
                                Some(resource.to_string()),
                                "role excluded from PHI reaches a PHI=true resource".to_string(),
                            ));
                        }
                    }
                }
            }

            ComplianceCheck::InfrastructureDataDenial => {
                let infrastructure = policy
                    .roles
                    .iter()
                    .filter(|r| r.category == GroupCategory::Infrastructure);
                for role in infrastructure {
                    for grant in policy.grants_for(&role.name).filter(|g| g.has_data_verb()) {
                        let verbs: Vec<&str> = grant
                            .actions
                            .iter()
                            .filter(|a| a.is_data_verb())
                            .map(Action::as_str)
                            .collect();
                        findings.push(finding(
                            Some(role.name.as_str()),
                            Some(grant.resource.to_string()),
                            format!("infrastructure role holds data verbs {}", verbs.join(", ")),
                        ));
                    }
                }
            }

            ComplianceCheck::TenantTagMembership => {
                let allowed: &[String] = policy
                    .tag(TagKey::TenantId)
                    .map(|t| t.values.as_slice())
                    .unwrap_or(&[]);
                for grant in &policy.grants {
                    for tenant in grant.tenant_values().filter(|t| !allowed.contains(t)) {
                        findings.push(finding(
                            Some(grant.role.as_str()),
                            Some(grant.resource.to_string()),
                            format!("TenantID '{}' is not an allowed TenantID value", tenant),
                        ));
                    }
                }
            }

            ComplianceCheck::TenantIsolation => {
                for role in policy.roles.iter().filter(|r| !r.tenants.is_empty()) {
                    for grant in policy.grants_for(&role.name) {
                        let scoped = grant.tag_conditions.iter().any(|c| {
                            matches!(c, TagCondition::In { key: TagKey::TenantId, .. })
                        });
                        if !scoped {
                            findings.push(finding(
                                Some(role.name.as_str()),
                                Some(grant.resource.to_string()),
                                "tenant-scoped role has a grant without a TenantID condition".to_string(),
                            ));
                        }
                        for tenant in grant.tenant_values().filter(|t| !role.tenants.contains(t)) {
                            findings.push(finding(
                                Some(role.name.as_str()),
                                Some(grant.resource.to_string()),
                                format!("grant reaches foreign tenant '{}'", tenant),
                            ));
                        }
                    }
                }
            }

            ComplianceCheck::RequiredResourceTags => {
                for resource in &policy.resources {
                    for key in TagKey::REQUIRED {
                        if resource.tag(key).is_none() {
                            findings.push(finding(
                                None,
                                Some(resource.resource.to_string()),
                                format!("missing required tag {}", key),
                            ));
                        }
                    }
                    if let Some(env) = resource.tag(TagKey::Environment) {
                        if env != policy.environment {
                            findings.push(finding(
                                None,
                                Some(resource.resource.to_string()),
                                format!("Environment tag '{}' does not match '{}'", env, policy.environment),
                            ));
                        }
                    }
                }
            }

            ComplianceCheck::FederatedTrust => {
                for role in policy.roles.iter().filter(|r| r.trust.is_none()) {
                    findings.push(finding(
                        Some(role.name.as_str()),
                        None,
                        format!("group '{}' has no directory id; role has no trust condition", role.group_name),
                    ));
                }
            }
        }

        findings
    }
}

/// One violation found by a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFinding {
    pub check: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub message: String,
}

/// Outcome of one named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub description: String,
    pub passed: bool,
    #[serde(default)]
    pub advisory: bool,
    pub findings: Vec<ComplianceFinding>,
}

/// Machine-readable report suitable for CI gating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub environment: String,
    pub checks: Vec<CheckResult>,
}

impl ComplianceReport {
    pub fn passed(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Failing checks that gate a deployment
    pub fn failed(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed && !c.advisory)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Advisory checks that produced findings
    pub fn advisories(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.advisory)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn is_compliant(&self) -> bool {
        self.checks.iter().all(|c| c.passed || c.advisory)
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn findings(&self) -> impl Iterator<Item = &ComplianceFinding> {
        self.checks.iter().flat_map(|c| c.findings.iter())
    }
}

/// Runs the check battery
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceValidator;

impl ComplianceValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, policy: &ResolvedPolicySet) -> Result<ComplianceReport> {
        Self::check_structure(policy)?;

        let engine = PermissionEngine::from_policy(policy);
        let checks = ComplianceCheck::ALL
            .iter()
            .map(|check| {
                let findings = check.run(policy, &engine);
                if !findings.is_empty() {
                    tracing::warn!(
                        environment = %policy.environment,
                        check = check.name(),
                        advisory = check.is_advisory(),
                        findings = findings.len(),
                        "compliance check failed"
                    );
                }
                CheckResult {
                    name: check.name().to_string(),
                    description: check.description().to_string(),
                    passed: findings.is_empty(),
                    advisory: check.is_advisory(),
                    findings,
                }
            })
            .collect();

        Ok(ComplianceReport {
            environment: policy.environment.clone(),
            checks,
        })
    }

    fn check_structure(policy: &ResolvedPolicySet) -> Result<()> {
        let mut names = HashSet::new();
        for role in &policy.roles {
            if !names.insert(role.name.as_str()) {
                return Err(GovernanceError::InvariantViolation(format!(
                    "role '{}' appears twice in the policy set",
                    role.name
                )));
            }
        }
        for grant in &policy.grants {
            if !names.contains(grant.role.as_str()) {
                return Err(GovernanceError::InvariantViolation(format!(
                    "grant on {} references unknown role '{}'",
                    grant.resource, grant.role
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn role(name: &str, category: GroupCategory, exclude_phi: bool) -> Role {
        Role {
            name: name.to_string(),
            arn: format!("arn:aws:iam::111111111111:role/{}", name),
            group_name: name.to_string(),
            category,
            exclude_phi,
            is_data_lake_admin: false,
            tenants: vec![],
            trust: Some(TrustCondition {
                provider_arn: "arn:aws:iam::111111111111:saml-provider/IdentityCenter".to_string(),
                group_ids: vec![format!("g-{}", name)],
            }),
            max_session_duration_secs: 3_600,
        }
    }

    fn grant(role: &str, actions: &[Action], conditions: Vec<TagCondition>) -> PermissionGrant {
        PermissionGrant {
            role: role.to_string(),
            resource: Resource::Database { name: "clinical".to_string() },
            actions: actions.to_vec(),
            tag_conditions: conditions,
            grant_option: false,
        }
    }

    fn tagged(table: &str, phi: &str) -> TaggedResource {
        let mut tags = BTreeMap::new();
        tags.insert(TagKey::Environment, "dev".to_string());
        tags.insert(TagKey::Phi, phi.to_string());
        TaggedResource {
            resource: ResourceRef::table("clinical", table),
            tags,
        }
    }

    fn policy(roles: Vec<Role>, grants: Vec<PermissionGrant>) -> ResolvedPolicySet {
        ResolvedPolicySet {
            environment: "dev".to_string(),
            is_production: false,
            roles,
            grants,
            tags: vec![ClassificationTag {
                key: TagKey::TenantId,
                values: vec!["tenant-a".to_string(), "multi-tenant".to_string()],
                description: None,
            }],
            resources: vec![tagged("patients", "true"), tagged("encounters", "false")],
            warnings: vec![],
        }
    }

    #[test]
    fn test_clean_policy_passes_every_check() {
        let policy = policy(
            vec![role("dev-analysts", GroupCategory::Analyst, true)],
            vec![grant("dev-analysts", &[Action::Select], vec![TagCondition::phi_excluded()])],
        );
        let report = ComplianceValidator::new().validate(&policy).unwrap();

        assert!(report.is_compliant());
        assert_eq!(report.checks.len(), ComplianceCheck::ALL.len());
        assert_eq!(report.passed().len(), ComplianceCheck::ALL.len());
        assert!(report.failed().is_empty());
    }

    #[test]
    fn test_phi_exclusion_without_condition_fails() {
        let policy = policy(
            vec![role("dev-analysts", GroupCategory::Analyst, true)],
            vec![grant("dev-analysts", &[Action::Select], vec![])],
        );
        let report = ComplianceValidator::new().validate(&policy).unwrap();

        assert_eq!(report.failed(), vec!["phi-exclusion"]);
        let check = report.check("phi-exclusion").unwrap();
        assert!(check
            .findings
            .iter()
            .any(|f| f.resource.as_deref() == Some("clinical.patients")));
    }

    #[test]
    fn test_all_checks_run_when_several_fail() {
        let mut untrusted = role("dev-deployers", GroupCategory::Infrastructure, false);
        untrusted.trust = None;
        let policy = policy(
            vec![untrusted],
            vec![grant(
                "dev-deployers",
                &[Action::Describe, Action::All],
                vec![TagCondition::tenant_in(&["tenant-z".to_string()])],
            )],
        );
        let report = ComplianceValidator::new().validate(&policy).unwrap();

        assert_eq!(report.checks.len(), ComplianceCheck::ALL.len());
        assert_eq!(report.failed(), vec!["infrastructure-data-denial", "tenant-tag-membership"]);
        assert_eq!(report.advisories(), vec!["federated-trust"]);
    }

    #[test]
    fn test_missing_trust_is_advisory() {
        let mut unsynced = role("dev-analysts", GroupCategory::Analyst, true);
        unsynced.trust = None;
        let policy = policy(
            vec![unsynced],
            vec![grant("dev-analysts", &[Action::Select], vec![TagCondition::phi_excluded()])],
        );
        let report = ComplianceValidator::new().validate(&policy).unwrap();

        assert!(report.is_compliant());
        assert!(report.failed().is_empty());
        let check = report.check("federated-trust").unwrap();
        assert!(!check.passed);
        assert!(check.advisory);
        assert_eq!(check.findings[0].role.as_deref(), Some("dev-analysts"));
    }

    #[test]
    fn test_tenant_isolation() {
        let mut scoped = role("dev-tenant-a", GroupCategory::Analyst, false);
        scoped.tenants = vec!["tenant-a".to_string()];
        let policy = policy(
            vec![scoped],
            vec![
                grant("dev-tenant-a", &[Action::Select], vec![]),
                grant(
                    "dev-tenant-a",
                    &[Action::Select],
                    vec![TagCondition::tenant_in(&["tenant-a".to_string(), "multi-tenant".to_string()])],
                ),
            ],
        );
        let report = ComplianceValidator::new().validate(&policy).unwrap();
        let check = report.check("tenant-isolation").unwrap();

        assert!(!check.passed);
        assert_eq!(check.findings.len(), 2);
    }

    #[test]
    fn test_required_tags_and_environment_mismatch() {
        let mut policy = policy(vec![], vec![]);
        policy.resources[0].tags.remove(&TagKey::Phi);
        policy.resources[1]
            .tags
            .insert(TagKey::Environment, "prod".to_string());

        let report = ComplianceValidator::new().validate(&policy).unwrap();
        let check = report.check("required-resource-tags").unwrap();
        assert_eq!(check.findings.len(), 2);
    }

    #[test]
    fn test_unknown_role_is_invariant_violation() {
        let policy = policy(vec![], vec![grant("ghost", &[Action::Select], vec![])]);
        assert!(matches!(
            ComplianceValidator::new().validate(&policy),
            Err(GovernanceError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_report_serializes_every_check() {
        let policy = policy(vec![], vec![]);
        let report = ComplianceValidator::new().validate(&policy).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        let names: Vec<&str> = json["checks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ComplianceCheck::ALL.iter().map(|c| c.name()).collect::<Vec<_>>()
        );
    }
}
