//! Declarative deployment configuration.
//!
//! One file describes every environment of a deployment. It is loaded once,
//! validated, and treated as read-only input by the rest of the crate.

use crate::error::{GovernanceError, Result};
use crate::identity::StaticDirectory;
use crate::reconciler::RepositoryKind;
use crate::types::{Action, GroupCategory, TagKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// IAM allows role sessions between one and twelve hours.
const MIN_SESSION_SECS: u32 = 3_600;
const MAX_SESSION_SECS: u32 = 43_200;

fn default_session_duration() -> u32 {
    14_400
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    /// Application name used to scope reconciled resource names
    pub application: String,
    /// Tenant ids known to the deployment
    #[serde(default)]
    pub tenants: Vec<String>,
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Custom tag values, unioned with the built-in taxonomy
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
    /// Abort instead of attempting creation when an existence probe fails
    #[serde(default)]
    pub strict_probe: bool,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// Identity provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Federated identity provider trusted by synthesized roles
    #[serde(default)]
    pub provider_arn: Option<String>,
    /// Group name -> external group id, as synchronized from the directory
    #[serde(default)]
    pub groups: BTreeMap<String, String>,
}

/// Per-environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Filled from the `environments` key at load time
    #[serde(default)]
    pub name: String,
    pub account_id: String,
    pub region: String,
    pub is_production: bool,
    #[serde(default = "default_session_duration")]
    pub max_session_duration_secs: u32,
    #[serde(default)]
    pub groups: Vec<GroupMapping>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub containers: Vec<String>,
    /// Container name -> repository kind
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryKind>,
}

/// Immutable environment identity handed to the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub account_id: String,
    pub region: String,
    pub is_production: bool,
    pub max_session_duration_secs: u32,
}

/// Mapping from one identity group to its data-lake permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapping {
    #[serde(alias = "group_name")]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub description: String,
    pub permissions: Vec<Action>,
    #[serde(default)]
    pub allowed_databases: Vec<String>,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    pub exclude_phi: bool,
    pub is_data_lake_admin: bool,
    #[serde(default)]
    pub category: GroupCategory,
    /// Tenants this group is confined to; empty means not tenant-scoped
    #[serde(default)]
    pub tenants: Vec<String>,
}

/// Catalog resource to classify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub catalog_id: Option<String>,
    pub database: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Secret to import or create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Initial value when the secret has to be created
    #[serde(default)]
    pub value: Option<String>,
}

impl LakeConfig {
    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LakeConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GovernanceError::config(format!("invalid YAML: {}", e)))?;
        config.finish()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: LakeConfig = serde_json::from_str(json)
            .map_err(|e| GovernanceError::config(format!("invalid JSON: {}", e)))?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        for (name, env) in self.environments.iter_mut() {
            env.name = name.clone();
        }
        self.validate()?;
        Ok(self)
    }

    /// Load-time validation of everything that does not need resolution
    pub fn validate(&self) -> Result<()> {
        if self.application.trim().is_empty() {
            return Err(GovernanceError::config("application name is empty"));
        }
        if self.environments.is_empty() {
            return Err(GovernanceError::config("no environments defined"));
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.trim().is_empty() {
                return Err(GovernanceError::config("tenant id is empty"));
            }
            if !seen.insert(tenant.as_str()) {
                return Err(GovernanceError::config(format!("duplicate tenant id '{}'", tenant)));
            }
        }

        for key in self.tags.keys() {
            key.parse::<TagKey>()?;
        }

        for env in self.environments.values() {
            env.validate()?;
        }
        Ok(())
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            GovernanceError::config(format!(
                "unknown environment '{}' (known: {:?})",
                name,
                self.environments.keys().collect::<Vec<_>>()
            ))
        })
    }

    /// Custom tag values keyed by tag key. Keys were checked at load time.
    pub fn custom_tag_values(&self) -> Result<BTreeMap<TagKey, Vec<String>>> {
        self.tags
            .iter()
            .map(|(key, values)| -> Result<(TagKey, Vec<String>)> {
                Ok((key.parse::<TagKey>()?, values.clone()))
            })
            .collect()
    }

    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.identity.groups.clone())
    }
}

impl EnvironmentConfig {
    pub fn environment(&self) -> Environment {
        Environment {
            name: self.name.clone(),
            account_id: self.account_id.clone(),
            region: self.region.clone(),
            is_production: self.is_production,
            max_session_duration_secs: self.max_session_duration_secs,
        }
    }

    fn validate(&self) -> Result<()> {
        let env = &self.name;
        if env.trim().is_empty() {
            return Err(GovernanceError::config("environment name is empty"));
        }
        if self.account_id.len() != 12 || !self.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(GovernanceError::config(format!(
                "environment '{}': account id '{}' is not a 12-digit AWS account",
                env, self.account_id
            )));
        }
        if self.region.trim().is_empty() {
            return Err(GovernanceError::config(format!("environment '{}': region is empty", env)));
        }
        if !(MIN_SESSION_SECS..=MAX_SESSION_SECS).contains(&self.max_session_duration_secs) {
            return Err(GovernanceError::config(format!(
                "environment '{}': max_session_duration_secs must be between {} and {}",
                env, MIN_SESSION_SECS, MAX_SESSION_SECS
            )));
        }

        let mut groups = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(GovernanceError::config(format!(
                    "environment '{}': group mapping without a name",
                    env
                )));
            }
            if !groups.insert(group.name.as_str()) {
                return Err(GovernanceError::config(format!(
                    "environment '{}': duplicate group '{}'",
                    env, group.name
                )));
            }
        }

        let mut secrets = HashSet::new();
        for secret in &self.secrets {
            if secret.name.trim().is_empty() || secret.name.contains('/') {
                return Err(GovernanceError::config(format!(
                    "environment '{}': invalid secret name '{}'",
                    env, secret.name
                )));
            }
            if !secrets.insert(secret.name.as_str()) {
                return Err(GovernanceError::config(format!(
                    "environment '{}': duplicate secret '{}'",
                    env, secret.name
                )));
            }
        }

        for container in self.repositories.keys() {
            if !self.containers.contains(container) {
                tracing::warn!(
                    environment = %env,
                    container = %container,
                    "repository mapping names a container that is not declared"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
application: clinical-lake
tenants: ["tenant-a", "tenant-b"]
identity:
  provider_arn: "arn:aws:iam::111111111111:saml-provider/IdentityCenter"
  groups:
    data-engineers-dev: "g-0001"
tags:
  DataType: ["imaging"]
environments:
  dev:
    account_id: "111111111111"
    region: us-east-2
    is_production: false
    groups:
      - name: data-engineers-dev
        email: data-eng@example.com
        description: Data engineering
        permissions: [SELECT, INSERT]
        allowed_databases: ["*"]
        exclude_phi: false
        is_data_lake_admin: true
    secrets:
      - name: db-secret
        description: Warehouse credentials
    containers: [api, worker]
    repositories:
      api: api
  prod:
    account_id: "222222222222"
    region: us-east-2
    is_production: true
    max_session_duration_secs: 3600
"#;

    #[test]
    fn test_parse_yaml_config() {
        let config = LakeConfig::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(config.application, "clinical-lake");
        assert_eq!(config.environments.len(), 2);

        let dev = config.environment("dev").unwrap();
        assert_eq!(dev.name, "dev");
        assert_eq!(dev.max_session_duration_secs, 14_400);
        assert_eq!(dev.groups[0].permissions, vec![Action::Select, Action::Insert]);
        assert_eq!(dev.groups[0].category, GroupCategory::Other);
        assert_eq!(dev.repositories.get("api"), Some(&RepositoryKind::Api));
    }

    #[test]
    fn test_environment_identity() {
        let config = LakeConfig::from_yaml(SAMPLE_YAML).unwrap();
        let prod = config.environment("prod").unwrap().environment();
        assert!(prod.is_production);
        assert_eq!(prod.account_id, "222222222222");
        assert_eq!(prod.max_session_duration_secs, 3_600);
    }

    #[test]
    fn test_unknown_environment() {
        let config = LakeConfig::from_yaml(SAMPLE_YAML).unwrap();
        assert!(matches!(
            config.environment("staging"),
            Err(GovernanceError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_required_group_field() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
    groups:
      - name: analysts
        permissions: [SELECT]
        exclude_phi: true
"#;
        let err = LakeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("is_data_lake_admin"));
    }

    #[test]
    fn test_unknown_verb_rejected_at_load() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
    groups:
      - name: analysts
        permissions: [TRUNCATE]
        exclude_phi: true
        is_data_lake_admin: false
"#;
        assert!(matches!(
            LakeConfig::from_yaml(yaml),
            Err(GovernanceError::Configuration(_))
        ));
    }

    #[test]
    fn test_lowercase_verbs_accepted_at_load() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
    groups:
      - name: analysts
        permissions: [select, describe]
        exclude_phi: true
        is_data_lake_admin: false
"#;
        let config = LakeConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.environment("dev").unwrap().groups[0].permissions,
            vec![Action::Select, Action::Describe]
        );
    }

    #[test]
    fn test_unknown_repository_kind_rejected_at_load() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
    containers: [api]
    repositories:
      api: lambda
"#;
        assert!(LakeConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_account_id() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "12345"
    region: us-east-1
    is_production: false
"#;
        let err = LakeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("12-digit"));
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let yaml = r#"
application: app
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
    groups:
      - { name: analysts, permissions: [SELECT], exclude_phi: true, is_data_lake_admin: false }
      - { name: analysts, permissions: [DESCRIBE], exclude_phi: true, is_data_lake_admin: false }
"#;
        let err = LakeConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate group 'analysts'"));
    }

    #[test]
    fn test_unknown_custom_tag_key() {
        let yaml = r#"
application: app
tags:
  Owner: ["team-a"]
environments:
  dev:
    account_id: "111111111111"
    region: us-east-1
    is_production: false
"#;
        assert!(matches!(
            LakeConfig::from_yaml(yaml),
            Err(GovernanceError::UnknownTagKey(_))
        ));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lake.json");
        std::fs::write(
            &path,
            r#"{
  "application": "app",
  "environments": {
    "dev": { "account_id": "111111111111", "region": "us-east-1", "is_production": false }
  }
}"#,
        )
        .unwrap();

        let config = LakeConfig::load(&path).unwrap();
        assert_eq!(config.environment("dev").unwrap().region, "us-east-1");
    }
}
