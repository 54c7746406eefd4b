//! Idempotent import-or-create of externally named resources.
//!
//! The reconciler never overwrites a resource that already exists: an
//! existing secret or repository is imported as-is, and only an absent one
//! is created from the caller's defaults.

use crate::backend::RemoteResourceProvider;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Kinds of remote resources handled by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Secret,
    Repository,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Secret => f.write_str("secret"),
            ResourceKind::Repository => f.write_str("repository"),
        }
    }
}

/// Result of an existence probe.
///
/// "Not found" and "could not tell" are distinct outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The resource exists; carries its reference (ARN, URI, ...)
    Exists(String),
    NotFound,
    ProbeError(String),
}

/// What to do when a probe fails for a reason other than "not found"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeErrorPolicy {
    /// Log and attempt creation; a partially failing remote does not block
    /// the rest of the deployment
    #[default]
    AttemptCreate,
    /// Stop reconciling this resource
    Abort,
}

/// Values used only when a resource has to be created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDefaults {
    #[serde(default)]
    pub description: Option<String>,
    /// Initial payload (a secret value, for instance)
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileState {
    Imported,
    Created,
}

/// A resource resolved during this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledResource {
    pub logical_name: String,
    pub qualified_name: String,
    pub kind: ResourceKind,
    pub state: ReconcileState,
    /// Provider reference, opaque to the reconciler
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("failed to create {kind} '{name}': {message}")]
    Create {
        kind: ResourceKind,
        name: String,
        message: String,
    },
    #[error("existence probe for {kind} '{name}' failed: {message}")]
    Probe {
        kind: ResourceKind,
        name: String,
        message: String,
    },
}

type Outcome = Result<ReconciledResource, ReconcileError>;

/// Resolve-or-create over one provider, for the lifetime of one run.
///
/// Each logical name owns a single-flight cell: concurrent callers for the
/// same name wait for the first one, and every later call returns the cached
/// outcome without probing again. Failed outcomes are cached as well, so
/// creation is attempted at most once per name per run.
pub struct ResourceReconciler {
    provider: Arc<dyn RemoteResourceProvider>,
    on_probe_error: ProbeErrorPolicy,
    cache: Mutex<HashMap<String, Arc<OnceCell<Outcome>>>>,
    probes: AtomicUsize,
    creates: AtomicUsize,
}

impl ResourceReconciler {
    pub fn new(provider: Arc<dyn RemoteResourceProvider>) -> Self {
        Self {
            provider,
            on_probe_error: ProbeErrorPolicy::default(),
            cache: Mutex::new(HashMap::new()),
            probes: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn with_probe_error_policy(mut self, policy: ProbeErrorPolicy) -> Self {
        self.on_probe_error = policy;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.provider.kind()
    }

    pub async fn resolve_or_create(
        &self,
        logical_name: &str,
        qualified_name: &str,
        defaults: &CreateDefaults,
    ) -> Outcome {
        let cell = {
            let mut cache = self.cache.lock().await;
            cache.entry(logical_name.to_string()).or_default().clone()
        };

        if let Some(cached) = cell.get() {
            if let Ok(resource) = cached {
                if resource.qualified_name != qualified_name {
                    tracing::warn!(
                        logical_name,
                        cached = %resource.qualified_name,
                        requested = %qualified_name,
                        "logical name already resolved under another qualified name"
                    );
                }
            }
            return cached.clone();
        }

        cell.get_or_init(|| self.reconcile(logical_name, qualified_name, defaults))
            .await
            .clone()
    }

    async fn reconcile(&self, logical_name: &str, qualified_name: &str, defaults: &CreateDefaults) -> Outcome {
        let kind = self.provider.kind();
        self.probes.fetch_add(1, Ordering::SeqCst);

        match self.provider.probe(qualified_name).await {
            ProbeOutcome::Exists(reference) => {
                tracing::info!(%kind, name = %qualified_name, "importing existing resource");
                return Ok(ReconciledResource {
                    logical_name: logical_name.to_string(),
                    qualified_name: qualified_name.to_string(),
                    kind,
                    state: ReconcileState::Imported,
                    reference,
                });
            }
            ProbeOutcome::NotFound => {
                tracing::debug!(%kind, name = %qualified_name, "resource not found");
            }
            ProbeOutcome::ProbeError(message) => match self.on_probe_error {
                ProbeErrorPolicy::AttemptCreate => {
                    tracing::warn!(
                        %kind,
                        name = %qualified_name,
                        error = %message,
                        "existence probe failed; attempting creation"
                    );
                }
                ProbeErrorPolicy::Abort => {
                    tracing::error!(%kind, name = %qualified_name, error = %message, "existence probe failed");
                    return Err(ReconcileError::Probe {
                        kind,
                        name: qualified_name.to_string(),
                        message,
                    });
                }
            },
        }

        self.creates.fetch_add(1, Ordering::SeqCst);
        match self.provider.create(qualified_name, defaults).await {
            Ok(reference) => {
                tracing::info!(%kind, name = %qualified_name, "created resource");
                Ok(ReconciledResource {
                    logical_name: logical_name.to_string(),
                    qualified_name: qualified_name.to_string(),
                    kind,
                    state: ReconcileState::Created,
                    reference,
                })
            }
            Err(e) => {
                tracing::error!(%kind, name = %qualified_name, error = %e, "resource creation failed");
                Err(ReconcileError::Create {
                    kind,
                    name: qualified_name.to_string(),
                    message: format!("{:#}", e),
                })
            }
        }
    }

    /// Number of existence probes issued so far
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Number of creation attempts issued so far
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

/// Container image repository kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepositoryKind {
    Api,
    Web,
    Worker,
    Loader,
    Migration,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryKind::Api => "api",
            RepositoryKind::Web => "web",
            RepositoryKind::Worker => "worker",
            RepositoryKind::Loader => "loader",
            RepositoryKind::Migration => "migration",
        }
    }
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a container → repository lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryMapping {
    Mapped(RepositoryKind),
    Unmapped,
}

/// Look a container up in the configured mapping
pub fn repository_for(container: &str, mapping: &BTreeMap<String, RepositoryKind>) -> RepositoryMapping {
    match mapping.get(container) {
        Some(kind) => RepositoryMapping::Mapped(*kind),
        None => RepositoryMapping::Unmapped,
    }
}

/// `/<environment>/<application>/<name>`
pub fn secret_name(environment: &str, application: &str, name: &str) -> String {
    format!("/{}/{}/{}", environment, application, name)
}

/// `<environment>-<application>-<kind>`
pub fn repository_name(environment: &str, application: &str, kind: RepositoryKind) -> String {
    format!("{}-{}-{}", environment, application, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Scripted provider recording every call
    struct ScriptedProvider {
        probe: ProbeOutcome,
        fail_create: bool,
        created: StdMutex<Vec<(String, CreateDefaults)>>,
    }

    impl ScriptedProvider {
        fn new(probe: ProbeOutcome) -> Self {
            Self {
                probe,
                fail_create: false,
                created: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteResourceProvider for ScriptedProvider {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Secret
        }

        async fn probe(&self, _name: &str) -> ProbeOutcome {
            tokio::task::yield_now().await;
            self.probe.clone()
        }

        async fn create(&self, name: &str, defaults: &CreateDefaults) -> anyhow::Result<String> {
            if self.fail_create {
                return Err(anyhow!("access denied"));
            }
            self.created.lock().unwrap().push((name.to_string(), defaults.clone()));
            Ok(format!("arn:aws:secretsmanager:us-east-2:111111111111:secret:{}", name))
        }
    }

    fn defaults() -> CreateDefaults {
        CreateDefaults {
            description: Some("db credentials".to_string()),
            payload: Some("initial".to_string()),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_existing_resource_is_imported() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::Exists("arn:existing".to_string())));
        let reconciler = ResourceReconciler::new(provider.clone());

        let resource = reconciler
            .resolve_or_create("db-secret", "/prod/app/db-secret", &defaults())
            .await
            .unwrap();

        assert_eq!(resource.state, ReconcileState::Imported);
        assert_eq!(resource.reference, "arn:existing");
        assert!(provider.created.lock().unwrap().is_empty());
        assert_eq!(reconciler.create_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_resource_is_created_with_defaults() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::NotFound));
        let reconciler = ResourceReconciler::new(provider.clone());

        let resource = reconciler
            .resolve_or_create("db-secret", "/prod/app/db-secret", &defaults())
            .await
            .unwrap();

        assert_eq!(resource.state, ReconcileState::Created);
        let created = provider.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "/prod/app/db-secret");
        assert_eq!(created[0].1, defaults());
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::NotFound));
        let reconciler = ResourceReconciler::new(provider.clone());

        let first = reconciler
            .resolve_or_create("secret-x", "/dev/app/secret-x", &defaults())
            .await
            .unwrap();
        let second = reconciler
            .resolve_or_create("secret-x", "/dev/app/secret-x", &defaults())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(reconciler.probe_count(), 1);
        assert_eq!(reconciler.create_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_creation() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::NotFound));
        let reconciler = Arc::new(ResourceReconciler::new(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            handles.push(tokio::spawn(async move {
                reconciler
                    .resolve_or_create("secret-x", "/dev/app/secret-x", &CreateDefaults::default())
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(provider.created.lock().unwrap().len(), 1);
        assert_eq!(reconciler.create_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_error_falls_through_to_create() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::ProbeError("throttled".to_string())));
        let reconciler = ResourceReconciler::new(provider.clone());

        let resource = reconciler
            .resolve_or_create("db-secret", "/dev/app/db-secret", &defaults())
            .await
            .unwrap();
        assert_eq!(resource.state, ReconcileState::Created);
    }

    #[tokio::test]
    async fn test_strict_policy_aborts_on_probe_error() {
        let provider = Arc::new(ScriptedProvider::new(ProbeOutcome::ProbeError("throttled".to_string())));
        let reconciler = ResourceReconciler::new(provider.clone()).with_probe_error_policy(ProbeErrorPolicy::Abort);

        let err = reconciler
            .resolve_or_create("db-secret", "/dev/app/db-secret", &defaults())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Probe { .. }));
        assert_eq!(reconciler.create_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_retried_within_run() {
        let mut scripted = ScriptedProvider::new(ProbeOutcome::NotFound);
        scripted.fail_create = true;
        let reconciler = ResourceReconciler::new(Arc::new(scripted));

        let first = reconciler
            .resolve_or_create("db-secret", "/dev/app/db-secret", &defaults())
            .await;
        let second = reconciler
            .resolve_or_create("db-secret", "/dev/app/db-secret", &defaults())
            .await;

        assert!(matches!(first, Err(ReconcileError::Create { .. })));
        assert_eq!(first, second);
        assert_eq!(reconciler.create_count(), 1);
    }

    #[test]
    fn test_repository_lookup() {
        let mut mapping = BTreeMap::new();
        mapping.insert("api".to_string(), RepositoryKind::Api);

        assert_eq!(repository_for("api", &mapping), RepositoryMapping::Mapped(RepositoryKind::Api));
        assert_eq!(repository_for("sidecar", &mapping), RepositoryMapping::Unmapped);
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(secret_name("prod", "app", "db-secret"), "/prod/app/db-secret");
        assert_eq!(repository_name("dev", "app", RepositoryKind::Worker), "dev-app-worker");
    }
}
