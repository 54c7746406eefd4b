//! Emulated secrets store and image registry

use crate::storage::FileStorage;
use crate::{EmulatorState, StoredRepository, StoredSecret, EMULATOR_ACCOUNT, EMULATOR_REGION};
use anyhow::{bail, Result};
use async_trait::async_trait;
use lakegov_core::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Faults {
    unreachable: HashSet<String>,
    deny_create: HashSet<String>,
}

/// One resource kind of the emulator, sharing state with the catalog
pub struct EmulatorResourceStore {
    kind: ResourceKind,
    state: Arc<Mutex<EmulatorState>>,
    storage: Option<Arc<FileStorage>>,
    faults: Mutex<Faults>,
    probes: AtomicUsize,
    creates: AtomicUsize,
}

impl EmulatorResourceStore {
    pub(crate) fn new(kind: ResourceKind, state: Arc<Mutex<EmulatorState>>, storage: Option<Arc<FileStorage>>) -> Self {
        Self {
            kind,
            state,
            storage,
            faults: Mutex::new(Faults::default()),
            probes: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    /// Make probes for `name` fail as if the service were unreachable
    pub async fn set_unreachable(&self, name: &str) {
        self.faults.lock().await.unreachable.insert(name.to_string());
    }

    /// Make creation of `name` fail with an access error
    pub async fn deny_create(&self, name: &str) {
        self.faults.lock().await.deny_create.insert(name.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn secret_arn(name: &str) -> String {
        format!(
            "arn:aws:secretsmanager:{}:{}:secret:{}",
            EMULATOR_REGION,
            EMULATOR_ACCOUNT,
            name.trim_start_matches('/')
        )
    }

    fn repository_uri(name: &str) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com/{}", EMULATOR_ACCOUNT, EMULATOR_REGION, name)
    }

    async fn persist(&self, state: &EmulatorState) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save(state).await?;
        }
        Ok(())
    }
}

const GENERATED_SECRET_LENGTH: usize = 32;

/// Random value for secrets created without an initial payload
fn generated_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

#[async_trait]
impl RemoteResourceProvider for EmulatorResourceStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn probe(&self, name: &str) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().await.unreachable.contains(name) {
            return ProbeOutcome::ProbeError(format!("{} endpoint unreachable", self.kind));
        }

        let state = self.state.lock().await;
        let reference = match self.kind {
            ResourceKind::Secret => state.secrets.get(name).map(|s| s.arn.clone()),
            ResourceKind::Repository => state.repositories.get(name).map(|r| r.uri.clone()),
        };
        match reference {
            Some(reference) => ProbeOutcome::Exists(reference),
            None => ProbeOutcome::NotFound,
        }
    }

    async fn create(&self, name: &str, defaults: &CreateDefaults) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().await.deny_create.contains(name) {
            bail!("AccessDenied: not authorized to create {} '{}'", self.kind, name);
        }

        let mut state = self.state.lock().await;
        let reference = match self.kind {
            ResourceKind::Secret => {
                if state.secrets.contains_key(name) {
                    bail!("ResourceExists: secret '{}' already exists", name);
                }
                let arn = Self::secret_arn(name);
                state.secrets.insert(
                    name.to_string(),
                    StoredSecret {
                        arn: arn.clone(),
                        description: defaults.description.clone(),
                        value: defaults.payload.clone().unwrap_or_else(generated_secret),
                        tags: defaults.tags.clone(),
                    },
                );
                arn
            }
            ResourceKind::Repository => {
                if state.repositories.contains_key(name) {
                    bail!("RepositoryAlreadyExists: repository '{}' already exists", name);
                }
                let uri = Self::repository_uri(name);
                state.repositories.insert(
                    name.to_string(),
                    StoredRepository {
                        uri: uri.clone(),
                        scan_on_push: true,
                        tags: defaults.tags.clone(),
                    },
                );
                uri
            }
        };
        self.persist(&state).await?;
        tracing::debug!(kind = %self.kind, name, "emulator created resource");
        Ok(reference)
    }
}
