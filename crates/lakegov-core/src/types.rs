//! Core data types for the access-control compiler

use crate::error::GovernanceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Permission verbs understood by the data catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Action {
    /// Every verb on the selected resources
    All,

    // Data verbs
    Select,
    Insert,
    Update,
    Delete,

    // Metadata and administrative verbs
    Describe,
    CreateTable,
    Alter,
    Drop,
    Grant,
    Revoke,
    DataLocationAccess,
}

impl Action {
    /// Verbs assigned to data-lake administrators, in grant order.
    pub const ADMIN_SET: [Action; 7] = [
        Action::Grant,
        Action::Revoke,
        Action::CreateTable,
        Action::Alter,
        Action::Drop,
        Action::Select,
        Action::Describe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::All => "ALL",
            Action::Select => "SELECT",
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Describe => "DESCRIBE",
            Action::CreateTable => "CREATE_TABLE",
            Action::Alter => "ALTER",
            Action::Drop => "DROP",
            Action::Grant => "GRANT",
            Action::Revoke => "REVOKE",
            Action::DataLocationAccess => "DATA_LOCATION_ACCESS",
        }
    }

    /// True for verbs that read or write row data. `ALL` counts because it
    /// implies every data verb.
    pub fn is_data_verb(&self) -> bool {
        matches!(
            self,
            Action::All | Action::Select | Action::Insert | Action::Update | Action::Delete
        )
    }

    /// Whether holding `self` allows `other`.
    pub fn implies(&self, other: &Action) -> bool {
        *self == Action::All || self == other
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Action {
    type Error = GovernanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl FromStr for Action {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ALL" => Ok(Action::All),
            "SELECT" => Ok(Action::Select),
            "INSERT" => Ok(Action::Insert),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            "DESCRIBE" => Ok(Action::Describe),
            "CREATE_TABLE" => Ok(Action::CreateTable),
            "ALTER" => Ok(Action::Alter),
            "DROP" => Ok(Action::Drop),
            "GRANT" => Ok(Action::Grant),
            "REVOKE" => Ok(Action::Revoke),
            "DATA_LOCATION_ACCESS" => Ok(Action::DataLocationAccess),
            other => Err(GovernanceError::config(format!("unknown permission verb '{}'", other))),
        }
    }
}

/// Compliance tag keys. The set is fixed; only values are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TagKey {
    Environment,
    #[serde(rename = "PHI")]
    Phi,
    #[serde(rename = "TenantID")]
    TenantId,
    DataType,
    Sensitivity,
    SourceSystem,
}

impl TagKey {
    pub const ALL: [TagKey; 6] = [
        TagKey::Environment,
        TagKey::Phi,
        TagKey::TenantId,
        TagKey::DataType,
        TagKey::Sensitivity,
        TagKey::SourceSystem,
    ];

    /// Keys every tagged resource must carry.
    pub const REQUIRED: [TagKey; 2] = [TagKey::Environment, TagKey::Phi];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagKey::Environment => "Environment",
            TagKey::Phi => "PHI",
            TagKey::TenantId => "TenantID",
            TagKey::DataType => "DataType",
            TagKey::Sensitivity => "Sensitivity",
            TagKey::SourceSystem => "SourceSystem",
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagKey {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagKey::ALL
            .iter()
            .find(|key| key.as_str() == s)
            .copied()
            .ok_or_else(|| GovernanceError::UnknownTagKey(s.to_string()))
    }
}

/// Identity of a catalog database or table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl ResourceRef {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            catalog_id: None,
            database: name.into(),
            table: None,
        }
    }

    pub fn table(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            catalog_id: None,
            database: database.into(),
            table: Some(table.into()),
        }
    }

    /// The database a table belongs to (or itself for a database).
    pub fn parent_database(&self) -> ResourceRef {
        ResourceRef {
            catalog_id: self.catalog_id.clone(),
            database: self.database.clone(),
            table: None,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", self.database, table),
            None => f.write_str(&self.database),
        }
    }
}

/// Resource selector carried by a grant.
///
/// Wildcard selectors cover resources created after resolution too, so the
/// policy set does not have to be recomputed when tables are added.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// Every current and future database and table in the catalog
    Catalog,
    /// A database and everything in it
    Database { name: String },
    /// Every current and future table of one database
    TableWildcard { database: String },
    /// One table
    Table { database: String, table: String },
}

impl Resource {
    /// Check whether a concrete catalog resource falls under this selector
    pub fn covers(&self, target: &ResourceRef) -> bool {
        match self {
            Resource::Catalog => true,
            Resource::Database { name } => target.database == *name,
            Resource::TableWildcard { database } => {
                target.database == *database && target.table.is_some()
            }
            Resource::Table { database, table } => {
                target.database == *database && target.table.as_deref() == Some(table.as_str())
            }
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Catalog => f.write_str("CATALOG *"),
            Resource::Database { name } => write!(f, "DATABASE {}", name),
            Resource::TableWildcard { database } => write!(f, "{}.*", database),
            Resource::Table { database, table } => write!(f, "{}.{}", database, table),
        }
    }
}

/// Tag predicate a resource must satisfy for a grant to apply.
///
/// A resource that lacks the tag never satisfies the condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TagCondition {
    NotEquals { key: TagKey, value: String },
    In { key: TagKey, values: Vec<String> },
}

impl TagCondition {
    /// `PHI != true`
    pub fn phi_excluded() -> Self {
        TagCondition::NotEquals {
            key: TagKey::Phi,
            value: "true".to_string(),
        }
    }

    pub fn tenant_in(tenants: &[String]) -> Self {
        TagCondition::In {
            key: TagKey::TenantId,
            values: tenants.to_vec(),
        }
    }

    pub fn key(&self) -> TagKey {
        match self {
            TagCondition::NotEquals { key, .. } | TagCondition::In { key, .. } => *key,
        }
    }

    pub fn is_phi_exclusion(&self) -> bool {
        matches!(self, TagCondition::NotEquals { key: TagKey::Phi, value } if value == "true")
    }

    pub fn is_satisfied_by(&self, tags: &BTreeMap<TagKey, String>) -> bool {
        match self {
            TagCondition::NotEquals { key, value } => {
                tags.get(key).map(|actual| actual != value).unwrap_or(false)
            }
            TagCondition::In { key, values } => tags
                .get(key)
                .map(|actual| values.iter().any(|v| v == actual))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for TagCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagCondition::NotEquals { key, value } => write!(f, "{} != '{}'", key, value),
            TagCondition::In { key, values } => {
                let quoted: Vec<String> = values.iter().map(|v| format!("'{}'", v)).collect();
                write!(f, "{} IN ({})", key, quoted.join(", "))
            }
        }
    }
}

/// One authorization tuple produced by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Name of the role this grant belongs to
    pub role: String,
    pub resource: Resource,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_conditions: Vec<TagCondition>,
    #[serde(default)]
    pub grant_option: bool,
}

impl PermissionGrant {
    pub fn has_data_verb(&self) -> bool {
        self.actions.iter().any(Action::is_data_verb)
    }

    pub fn allows(&self, action: &Action) -> bool {
        self.actions.iter().any(|held| held.implies(action))
    }

    pub fn excludes_phi(&self) -> bool {
        self.tag_conditions.iter().any(TagCondition::is_phi_exclusion)
    }

    /// TenantID values named by this grant's conditions
    pub fn tenant_values(&self) -> impl Iterator<Item = &String> {
        self.tag_conditions.iter().flat_map(|condition| match condition {
            TagCondition::In {
                key: TagKey::TenantId,
                values,
            } => values.iter().collect::<Vec<_>>(),
            TagCondition::NotEquals {
                key: TagKey::TenantId,
                value,
            } => vec![value],
            _ => Vec::new(),
        })
    }

    pub fn conditions_satisfied_by(&self, tags: &BTreeMap<TagKey, String>) -> bool {
        self.tag_conditions.iter().all(|c| c.is_satisfied_by(tags))
    }
}

/// Kind of organizational group behind a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupCategory {
    DataEngineering,
    Analyst,
    /// Deployment automation; never receives data verbs
    Infrastructure,
    #[default]
    Other,
}

/// Federated trust: only sessions carrying one of `group_ids` may assume the role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustCondition {
    pub provider_arn: String,
    pub group_ids: Vec<String>,
}

impl TrustCondition {
    /// Render as an IAM trust policy document
    pub fn to_policy_document(&self) -> serde_json::Value {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Federated": self.provider_arn },
                "Action": ["sts:AssumeRoleWithSAML", "sts:TagSession"],
                "Condition": {
                    "StringEquals": { "SAML:aud": "https://signin.aws.amazon.com/saml" },
                    "ForAnyValue:StringEquals": { "aws:PrincipalTag/GroupId": self.group_ids }
                }
            }]
        })
    }
}

/// Principal synthesized from one group mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub arn: String,
    pub group_name: String,
    pub category: GroupCategory,
    pub exclude_phi: bool,
    pub is_data_lake_admin: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<String>,
    /// `None` when the directory does not know the group yet
    pub trust: Option<TrustCondition>,
    pub max_session_duration_secs: u32,
}

/// Compliance tag definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationTag {
    pub key: TagKey,
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClassificationTag {
    pub fn allows(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// A catalog database or table with its compliance tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedResource {
    pub resource: ResourceRef,
    pub tags: BTreeMap<TagKey, String>,
}

impl TaggedResource {
    pub fn tag(&self, key: TagKey) -> Option<&str> {
        self.tags.get(&key).map(String::as_str)
    }

    pub fn is_phi(&self) -> bool {
        self.tag(TagKey::Phi) == Some("true")
    }
}

/// Output of one resolution pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolicySet {
    pub environment: String,
    pub is_production: bool,
    pub roles: Vec<Role>,
    pub grants: Vec<PermissionGrant>,
    #[serde(default)]
    pub tags: Vec<ClassificationTag>,
    #[serde(default)]
    pub resources: Vec<TaggedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResolvedPolicySet {
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_for_group(&self, group: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.group_name == group)
    }

    /// Grants of one role, in resolution order
    pub fn grants_for<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a PermissionGrant> + 'a {
        self.grants.iter().filter(move |g| g.role == role)
    }

    pub fn tag(&self, key: TagKey) -> Option<&ClassificationTag> {
        self.tags.iter().find(|t| t.key == key)
    }
}

/// Result of applying one change to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    Success { message: String },
    Skipped { reason: String },
}
