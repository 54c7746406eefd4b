//! One deployment pass for one environment.
//!
//! Resolution and validation are pure. Only after the compliance gate
//! passes does the driver touch the catalog and the remote providers.

use crate::backend::{CatalogProvider, RemoteResourceProvider};
use crate::compliance::{ComplianceReport, ComplianceValidator};
use crate::config::{EnvironmentConfig, LakeConfig};
use crate::error::GovernanceError;
use crate::policy::resolve_environment;
use crate::reconciler::*;
use crate::types::{ApplyResult, ResolvedPolicySet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Refuse to apply anything when a compliance check fails
    pub enforce_compliance: bool,
    /// Stop after validation
    pub dry_run: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            enforce_compliance: true,
            dry_run: false,
        }
    }
}

/// Everything one pass produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub policy: ResolvedPolicySet,
    pub report: ComplianceReport,
    pub applied: Vec<ApplyResult>,
    pub secrets: Vec<ReconciledResource>,
    pub repositories: Vec<ReconciledResource>,
    pub unmapped_containers: Vec<String>,
    /// Reconciliation failures; these do not undo what was applied
    pub failures: Vec<String>,
}

impl DeploymentOutcome {
    pub fn is_clean(&self) -> bool {
        self.report.is_compliant() && self.failures.is_empty()
    }
}

/// Remote providers used for the reconciliation phase
#[derive(Clone)]
pub struct RemoteProviders {
    pub secrets: Arc<dyn RemoteResourceProvider>,
    pub repositories: Arc<dyn RemoteResourceProvider>,
}

pub struct DeploymentDriver<'a> {
    config: &'a LakeConfig,
    options: DriverOptions,
}

impl<'a> DeploymentDriver<'a> {
    pub fn new(config: &'a LakeConfig) -> Self {
        Self {
            config,
            options: DriverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    fn probe_policy(&self) -> ProbeErrorPolicy {
        if self.config.strict_probe {
            ProbeErrorPolicy::Abort
        } else {
            ProbeErrorPolicy::AttemptCreate
        }
    }

    /// Resolve and validate without touching any provider
    pub fn plan(&self, environment: &str) -> Result<(ResolvedPolicySet, ComplianceReport)> {
        let policy = resolve_environment(self.config, environment)?;
        let report = ComplianceValidator::new().validate(&policy)?;
        tracing::info!(
            environment,
            roles = policy.roles.len(),
            grants = policy.grants.len(),
            passed = report.passed().len(),
            failed = report.failed().len(),
            "resolved policy set"
        );
        Ok((policy, report))
    }

    pub async fn run(
        &self,
        environment: &str,
        catalog: &mut dyn CatalogProvider,
        remote: &RemoteProviders,
    ) -> Result<DeploymentOutcome> {
        let env_config = self.config.environment(environment)?;
        let (policy, report) = self.plan(environment)?;

        if self.options.enforce_compliance && !report.is_compliant() {
            let checks: Vec<String> = report.failed().iter().map(|c| c.to_string()).collect();
            tracing::error!(environment, failed = ?checks, "compliance gate failed; nothing applied");
            return Err(GovernanceError::NonCompliant {
                environment: environment.to_string(),
                checks,
            }
            .into());
        }

        let mut outcome = DeploymentOutcome {
            policy,
            report,
            applied: Vec::new(),
            secrets: Vec::new(),
            repositories: Vec::new(),
            unmapped_containers: Vec::new(),
            failures: Vec::new(),
        };

        if self.options.dry_run {
            tracing::info!(environment, "dry run; skipping apply and reconciliation");
            return Ok(outcome);
        }

        outcome.applied = apply_policy(&outcome.policy, catalog).await?;

        let secrets = ResourceReconciler::new(remote.secrets.clone()).with_probe_error_policy(self.probe_policy());
        let repositories =
            ResourceReconciler::new(remote.repositories.clone()).with_probe_error_policy(self.probe_policy());

        let (secret_results, (repository_results, unmapped)) = tokio::join!(
            self.reconcile_secrets(env_config, &secrets),
            self.reconcile_repositories(env_config, &repositories)
        );
        outcome.unmapped_containers = unmapped;

        for result in secret_results {
            match result {
                Ok(resource) => outcome.secrets.push(resource),
                Err(e) => outcome.failures.push(e.to_string()),
            }
        }
        for result in repository_results {
            match result {
                Ok(resource) => outcome.repositories.push(resource),
                Err(e) => outcome.failures.push(e.to_string()),
            }
        }

        Ok(outcome)
    }

    fn resource_tags(&self, environment: &str) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("Environment".to_string(), environment.to_string());
        tags.insert("Application".to_string(), self.config.application.clone());
        tags
    }

    async fn reconcile_secrets(
        &self,
        env: &EnvironmentConfig,
        reconciler: &ResourceReconciler,
    ) -> Vec<std::result::Result<ReconciledResource, ReconcileError>> {
        let mut results = Vec::with_capacity(env.secrets.len());
        for secret in &env.secrets {
            let qualified = secret_name(&env.name, &self.config.application, &secret.name);
            let defaults = CreateDefaults {
                description: secret.description.clone(),
                payload: secret.value.clone(),
                tags: self.resource_tags(&env.name),
            };
            results.push(reconciler.resolve_or_create(&secret.name, &qualified, &defaults).await);
        }
        results
    }

    async fn reconcile_repositories(
        &self,
        env: &EnvironmentConfig,
        reconciler: &ResourceReconciler,
    ) -> (Vec<std::result::Result<ReconciledResource, ReconcileError>>, Vec<String>) {
        let mut results = Vec::new();
        let mut unmapped = Vec::new();
        let mut seen = Vec::new();

        for container in &env.containers {
            let kind = match repository_for(container, &env.repositories) {
                RepositoryMapping::Mapped(kind) => kind,
                RepositoryMapping::Unmapped => {
                    tracing::warn!(container = %container, "container has no repository mapping; skipped");
                    unmapped.push(container.clone());
                    continue;
                }
            };
            // Containers sharing a kind share one repository
            if seen.contains(&kind) {
                continue;
            }
            seen.push(kind);

            let qualified = repository_name(&env.name, &self.config.application, kind);
            let defaults = CreateDefaults {
                description: Some(format!("{} images for {}", kind, self.config.application)),
                payload: None,
                tags: self.resource_tags(&env.name),
            };
            results.push(reconciler.resolve_or_create(kind.as_str(), &qualified, &defaults).await);
        }
        (results, unmapped)
    }
}

/// Push a resolved policy set to a catalog: tags first, then resource
/// classification, then roles and grants
pub async fn apply_policy(policy: &ResolvedPolicySet, catalog: &mut dyn CatalogProvider) -> Result<Vec<ApplyResult>> {
    let mut applied = Vec::new();

    for tag in &policy.tags {
        let result = catalog
            .define_tag(tag)
            .await
            .with_context(|| format!("failed to define tag {}", tag.key))?;
        applied.push(result);
    }

    for resource in &policy.resources {
        let result = catalog
            .tag_resource(resource)
            .await
            .with_context(|| format!("failed to tag {}", resource.resource))?;
        applied.push(result);
    }

    for role in &policy.roles {
        applied.push(
            catalog
                .register_role(role)
                .await
                .with_context(|| format!("failed to register role {}", role.name))?,
        );
        for grant in policy.grants_for(&role.name) {
            let result = catalog
                .grant_permissions(role, grant)
                .await
                .with_context(|| format!("failed to grant {} on {}", role.name, grant.resource))?;
            if let ApplyResult::Skipped { reason } = &result {
                tracing::warn!(role = %role.name, resource = %grant.resource, %reason, "grant skipped");
            }
            applied.push(result);
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const CONFIG: &str = r#"
application: clinical-lake
tenants: [tenant-a]
identity:
  groups:
    engineers: g-1
    analysts: g-2
environments:
  dev:
    account_id: "111111111111"
    region: us-east-2
    is_production: false
    groups:
      - name: engineers
        permissions: [SELECT]
        allowed_databases: [clinical]
        exclude_phi: true
        is_data_lake_admin: false
        category: data-engineering
      - name: analysts
        permissions: [SELECT, DESCRIBE]
        allowed_databases: [clinical]
        exclude_phi: true
        is_data_lake_admin: false
    catalog:
      - database: clinical
        tags: { PHI: "false" }
    secrets:
      - name: db-credentials
        value: initial
    containers: [api, worker, sidecar]
    repositories: { api: api, worker: worker }
"#;

    #[derive(Default)]
    struct RecordingCatalog {
        calls: Vec<String>,
    }

    #[async_trait]
    impl CatalogProvider for RecordingCatalog {
        async fn define_tag(&mut self, tag: &ClassificationTag) -> Result<ApplyResult> {
            self.calls.push(format!("tag {}", tag.key));
            Ok(ApplyResult::Success { message: String::new() })
        }

        async fn tag_resource(&mut self, resource: &TaggedResource) -> Result<ApplyResult> {
            self.calls.push(format!("classify {}", resource.resource));
            Ok(ApplyResult::Success { message: String::new() })
        }

        async fn grant_permissions(&mut self, role: &Role, grant: &PermissionGrant) -> Result<ApplyResult> {
            self.calls.push(format!("grant {} {}", role.name, grant.resource));
            Ok(ApplyResult::Success { message: String::new() })
        }
    }

    struct MemoryStore {
        kind: ResourceKind,
        existing: Vec<String>,
        created: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        fn new(kind: ResourceKind, existing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                kind,
                existing: existing.iter().map(|s| s.to_string()).collect(),
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteResourceProvider for MemoryStore {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        async fn probe(&self, name: &str) -> ProbeOutcome {
            if self.existing.iter().any(|e| e == name) {
                ProbeOutcome::Exists(format!("ref:{}", name))
            } else {
                ProbeOutcome::NotFound
            }
        }

        async fn create(&self, name: &str, _defaults: &CreateDefaults) -> Result<String> {
            self.created.lock().unwrap().push(name.to_string());
            Ok(format!("ref:{}", name))
        }
    }

    fn remote(secrets: Arc<MemoryStore>, repositories: Arc<MemoryStore>) -> RemoteProviders {
        RemoteProviders { secrets, repositories }
    }

    #[tokio::test]
    async fn test_full_run() {
        let config = LakeConfig::from_yaml(CONFIG).unwrap();
        let secrets = MemoryStore::new(ResourceKind::Secret, &["/dev/clinical-lake/db-credentials"]);
        let repositories = MemoryStore::new(ResourceKind::Repository, &[]);
        let mut catalog = RecordingCatalog::default();

        let outcome = DeploymentDriver::new(&config)
            .run("dev", &mut catalog, &remote(secrets.clone(), repositories.clone()))
            .await
            .unwrap();

        assert!(outcome.is_clean());
        assert_eq!(outcome.secrets.len(), 1);
        assert_eq!(outcome.secrets[0].state, ReconcileState::Imported);
        assert!(secrets.created.lock().unwrap().is_empty());

        let created = repositories.created.lock().unwrap().clone();
        assert_eq!(created, vec!["dev-clinical-lake-api", "dev-clinical-lake-worker"]);
        assert_eq!(outcome.unmapped_containers, vec!["sidecar"]);

        assert!(catalog.calls.iter().any(|c| c == "classify clinical"));
        assert!(catalog.calls.contains(&"grant dev-engineers DATABASE clinical".to_string()));
        assert_eq!(catalog.calls.first().map(String::as_str), Some("tag Environment"));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let config = LakeConfig::from_yaml(CONFIG).unwrap();
        let secrets = MemoryStore::new(ResourceKind::Secret, &[]);
        let repositories = MemoryStore::new(ResourceKind::Repository, &[]);
        let mut catalog = RecordingCatalog::default();

        let outcome = DeploymentDriver::new(&config)
            .with_options(DriverOptions {
                enforce_compliance: true,
                dry_run: true,
            })
            .run("dev", &mut catalog, &remote(secrets.clone(), repositories.clone()))
            .await
            .unwrap();

        assert!(outcome.report.is_compliant());
        assert!(catalog.calls.is_empty());
        assert!(secrets.created.lock().unwrap().is_empty());
        assert!(outcome.secrets.is_empty());
    }

    #[tokio::test]
    async fn test_noncompliant_environment_is_not_applied() {
        // a dev catalog entry classified as prod breaks required-resource-tags
        let yaml = CONFIG
            .replace("environments:\n", "tags: { Environment: [prod] }\nenvironments:\n")
            .replace(r#"tags: { PHI: "false" }"#, r#"tags: { PHI: "false", Environment: prod }"#);
        let config = LakeConfig::from_yaml(&yaml).unwrap();
        let mut catalog = RecordingCatalog::default();

        let err = DeploymentDriver::new(&config)
            .run(
                "dev",
                &mut catalog,
                &remote(
                    MemoryStore::new(ResourceKind::Secret, &[]),
                    MemoryStore::new(ResourceKind::Repository, &[]),
                ),
            )
            .await
            .unwrap_err();

        let err = err.downcast::<GovernanceError>().unwrap();
        assert!(
            matches!(err, GovernanceError::NonCompliant { ref checks, .. } if checks == &["required-resource-tags"])
        );
        assert!(catalog.calls.is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_group_still_deploys() {
        let yaml = CONFIG.replace("    analysts: g-2\n", "");
        let config = LakeConfig::from_yaml(&yaml).unwrap();
        let mut catalog = RecordingCatalog::default();

        let outcome = DeploymentDriver::new(&config)
            .run(
                "dev",
                &mut catalog,
                &remote(
                    MemoryStore::new(ResourceKind::Secret, &[]),
                    MemoryStore::new(ResourceKind::Repository, &[]),
                ),
            )
            .await
            .unwrap();

        assert!(outcome.report.is_compliant());
        assert_eq!(outcome.report.advisories(), vec!["federated-trust"]);
        assert_eq!(outcome.policy.warnings.len(), 1);
        assert!(catalog.calls.contains(&"grant dev-analysts DATABASE clinical".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let config = LakeConfig::from_yaml(CONFIG).unwrap();
        let mut catalog = RecordingCatalog::default();
        let result = DeploymentDriver::new(&config)
            .run(
                "qa",
                &mut catalog,
                &remote(
                    MemoryStore::new(ResourceKind::Secret, &[]),
                    MemoryStore::new(ResourceKind::Repository, &[]),
                ),
            )
            .await;
        assert!(result.is_err());
    }
}
