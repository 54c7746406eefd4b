//! # lakegov core
//!
//! Access-control compiler for a multi-tenant, PHI-bearing data lake:
//! identity groups become roles and tag-conditioned grants, catalog
//! resources get compliance tags, and the resolved set is checked against a
//! fixed battery of invariants. Also hosts the idempotent import-or-create
//! reconciler used for secrets and image repositories.

pub mod backend;
pub mod compliance;
pub mod config;
pub mod driver;
pub mod error;
pub mod identity;
pub mod permissions;
pub mod policy;
pub mod reconciler;
pub mod tags;
pub mod types;

pub use backend::*;
pub use compliance::*;
pub use config::*;
pub use driver::*;
pub use error::{GovernanceError, Result};
pub use identity::*;
pub use permissions::*;
pub use policy::*;
pub use reconciler::*;
pub use tags::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_grant() {
        let grant = PermissionGrant {
            role: "dev-analysts".to_string(),
            resource: Resource::Table {
                database: "clinical".to_string(),
                table: "encounters".to_string(),
            },
            actions: vec![Action::Select],
            tag_conditions: vec![TagCondition::phi_excluded()],
            grant_option: false,
        };

        assert!(grant.allows(&Action::Select));
        assert!(grant.excludes_phi());
        assert!(!grant.allows(&Action::Drop));
    }
}
