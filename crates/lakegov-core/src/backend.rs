//! Provider traits for the catalog and for externally named resources

use crate::reconciler::{CreateDefaults, ProbeOutcome, ResourceKind};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;

/// Catalog that stores classification tags and tag-conditioned grants.
/// This allows us to swap between the local emulator and Lake Formation.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Create a tag, or widen its allowed values
    async fn define_tag(&mut self, tag: &ClassificationTag) -> Result<ApplyResult>;

    /// Attach classification tags to a database or table
    async fn tag_resource(&mut self, resource: &TaggedResource) -> Result<ApplyResult>;

    /// Grant one resolved permission to a role
    async fn grant_permissions(&mut self, role: &Role, grant: &PermissionGrant) -> Result<ApplyResult>;

    /// Make a synthesized role known to the catalog.
    ///
    /// Providers whose roles live in a separate identity stack skip this.
    async fn register_role(&mut self, role: &Role) -> Result<ApplyResult> {
        Ok(ApplyResult::Skipped {
            reason: format!("role '{}' is managed outside the catalog", role.name),
        })
    }
}

/// Probe/create pair behind the resource reconciler
#[async_trait]
pub trait RemoteResourceProvider: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Look a resource up by its qualified name
    async fn probe(&self, name: &str) -> ProbeOutcome;

    /// Create a resource and return its reference
    async fn create(&self, name: &str, defaults: &CreateDefaults) -> Result<String>;
}

/// Configuration for provider implementations
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Local emulator (no AWS required)
    Emulator {
        /// Optional file to persist state
        state_file: Option<String>,
    },
    /// Real AWS services
    Aws {
        region: Option<String>,
        profile: Option<String>,
        /// Custom endpoint (for testing)
        endpoint: Option<String>,
    },
}
