//! # Governance emulator
//!
//! In-memory, file-persistable stand-in for the data catalog, the secrets
//! store and the image registry. Used for local development, CI dry runs
//! and tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use lakegov_core::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod engine;
pub mod remote;
pub mod storage;

pub use engine::EmulatorEngine;
pub use remote::EmulatorResourceStore;
pub use storage::{FileStorage, StateExporter};

pub const EMULATOR_ACCOUNT: &str = "000000000000";
pub const EMULATOR_REGION: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub arn: String,
    #[serde(default)]
    pub description: Option<String>,
    pub value: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRepository {
    pub uri: String,
    pub scan_on_push: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Complete state of the emulator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorState {
    /// Defined classification tags
    #[serde(default)]
    pub tags: BTreeMap<TagKey, ClassificationTag>,
    /// Classified databases and tables
    #[serde(default)]
    pub resources: Vec<TaggedResource>,
    /// Registered roles by name
    #[serde(default)]
    pub roles: BTreeMap<String, Role>,
    /// All granted permissions
    #[serde(default)]
    pub grants: Vec<PermissionGrant>,
    #[serde(default)]
    pub secrets: BTreeMap<String, StoredSecret>,
    #[serde(default)]
    pub repositories: BTreeMap<String, StoredRepository>,
}

impl EmulatorState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_resource(a: &ResourceRef, b: &ResourceRef) -> bool {
    a.database == b.database && a.table == b.table
}

/// Emulated catalog provider
pub struct EmulatorBackend {
    state: Arc<Mutex<EmulatorState>>,
    storage: Option<Arc<FileStorage>>,
    engine: EmulatorEngine,
}

impl EmulatorBackend {
    /// Create a new emulator, loading existing state when the file exists
    pub async fn new(state_file: Option<String>) -> Result<Self> {
        let storage = state_file.map(|path| Arc::new(FileStorage::new(path)));
        let state = match &storage {
            Some(storage) if storage.exists() => {
                let state = storage.load().await?;
                tracing::info!(path = %storage.path(), "loaded emulator state");
                state
            }
            _ => EmulatorState::new(),
        };

        let mut engine = EmulatorEngine::new();
        engine.update_state(&state);

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            storage,
            engine,
        })
    }

    async fn save_state(&self, state: &EmulatorState) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save(state).await?;
        }
        Ok(())
    }

    /// Snapshot of the current state (for inspection and export)
    pub async fn get_state(&self) -> EmulatorState {
        self.state.lock().await.clone()
    }

    /// Secrets store sharing this emulator's state
    pub fn secrets(&self) -> Arc<EmulatorResourceStore> {
        Arc::new(EmulatorResourceStore::new(
            ResourceKind::Secret,
            self.state.clone(),
            self.storage.clone(),
        ))
    }

    /// Image registry sharing this emulator's state
    pub fn repositories(&self) -> Arc<EmulatorResourceStore> {
        Arc::new(EmulatorResourceStore::new(
            ResourceKind::Repository,
            self.state.clone(),
            self.storage.clone(),
        ))
    }

    pub fn check_permission(&self, role: &str, resource: &ResourceRef, action: &Action) -> bool {
        self.engine.check_permission(role, resource, action)
    }

    pub fn check_permission_with_reason(&self, role: &str, resource: &ResourceRef, action: &Action) -> (bool, String) {
        self.engine.check_permission_with_reason(role, resource, action)
    }

    pub fn engine(&self) -> &EmulatorEngine {
        &self.engine
    }
}

#[async_trait]
impl CatalogProvider for EmulatorBackend {
    async fn define_tag(&mut self, tag: &ClassificationTag) -> Result<ApplyResult> {
        let mut state = self.state.lock().await;
        let entry = state.tags.entry(tag.key).or_insert_with(|| ClassificationTag {
            key: tag.key,
            values: Vec::new(),
            description: tag.description.clone(),
        });
        let before = entry.values.len();
        for value in &tag.values {
            if !entry.values.contains(value) {
                entry.values.push(value.clone());
            }
        }
        let added = entry.values.len() - before;
        let message = format!("Defined tag {} ({} new value(s))", tag.key, added);

        self.engine.update_state(&state);
        self.save_state(&state).await?;
        Ok(ApplyResult::Success { message })
    }

    async fn tag_resource(&mut self, resource: &TaggedResource) -> Result<ApplyResult> {
        let mut state = self.state.lock().await;
        for (key, value) in &resource.tags {
            match state.tags.get(key) {
                None => bail!("tag {} is not defined in the catalog", key),
                Some(tag) if !tag.allows(value) => {
                    bail!("value '{}' is not allowed for tag {}", value, key)
                }
                Some(_) => {}
            }
        }

        state
            .resources
            .retain(|r| !same_resource(&r.resource, &resource.resource));
        state.resources.push(resource.clone());
        let message = format!("Tagged {} with {} tag(s)", resource.resource, resource.tags.len());

        self.engine.update_state(&state);
        self.save_state(&state).await?;
        Ok(ApplyResult::Success { message })
    }

    async fn grant_permissions(&mut self, role: &Role, grant: &PermissionGrant) -> Result<ApplyResult> {
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role.name) {
            state.roles.insert(role.name.clone(), role.clone());
        }

        // Remove any existing grant for the same role and selector
        state
            .grants
            .retain(|g| !(g.role == grant.role && g.resource == grant.resource));

        let message = format!("Granted {:?} on {} to {}", grant.actions, grant.resource, grant.role);
        state.grants.push(grant.clone());

        self.engine.update_state(&state);
        self.save_state(&state).await?;
        Ok(ApplyResult::Success { message })
    }

    async fn register_role(&mut self, role: &Role) -> Result<ApplyResult> {
        let mut state = self.state.lock().await;
        state.roles.insert(role.name.clone(), role.clone());
        self.save_state(&state).await?;
        Ok(ApplyResult::Success {
            message: format!("Registered role {}", role.name),
        })
    }
}
