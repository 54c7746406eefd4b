//! Compliance tag taxonomy and resource classification

use crate::config::{CatalogEntry, Environment, LakeConfig};
use crate::error::{GovernanceError, Result};
use crate::types::{ClassificationTag, ResourceRef, TagKey, TaggedResource};
use std::collections::BTreeMap;

pub const PHI_VALUES: [&str; 2] = ["true", "false"];
pub const MULTI_TENANT: &str = "multi-tenant";
pub const DATA_TYPES: [&str; 5] = ["clinical", "research", "operational", "administrative", "reference"];
pub const SENSITIVITY_LEVELS: [&str; 4] = ["public", "internal", "confidential", "restricted"];
pub const SOURCE_SYSTEMS: [&str; 7] = [
    "epic",
    "cerner",
    "allscripts",
    "healthlake",
    "external-api",
    "manual-import",
    "unknown",
];

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Append `extra` to `values`, skipping what is already present
fn union_into(values: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !values.contains(value) {
            values.push(value.clone());
        }
    }
}

/// Owns the tag definitions of one deployment target.
///
/// Values only ever grow: redefining a tag or adding custom values unions
/// them with what is already there, so a deployed taxonomy cannot be
/// narrowed by accident.
#[derive(Debug, Clone, Default)]
pub struct TagEngine {
    tags: BTreeMap<TagKey, ClassificationTag>,
}

impl TagEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in taxonomy for one environment
    pub fn with_default_taxonomy(environment: &str, tenants: &[String]) -> Self {
        let mut engine = Self::new();
        let mut tenant_values = tenants.to_vec();
        union_into(&mut tenant_values, &[MULTI_TENANT.to_string()]);

        engine.define_tag(TagKey::Environment, &[environment.to_string()], None);
        engine.define_tag(TagKey::Phi, &owned(&PHI_VALUES), None);
        engine.define_tag(TagKey::TenantId, &tenant_values, None);
        engine.define_tag(TagKey::DataType, &owned(&DATA_TYPES), None);
        engine.define_tag(TagKey::Sensitivity, &owned(&SENSITIVITY_LEVELS), None);
        engine.define_tag(TagKey::SourceSystem, &owned(&SOURCE_SYSTEMS), None);
        engine
    }

    /// Built-in taxonomy plus the configuration's custom values
    pub fn for_environment(config: &LakeConfig, environment: &Environment) -> Result<Self> {
        let mut engine = Self::with_default_taxonomy(&environment.name, &config.tenants);
        for (key, values) in config.custom_tag_values()? {
            engine.extend(key, &values)?;
        }
        Ok(engine)
    }

    /// Define (or widen) a tag. Custom values are unioned with the defaults.
    pub fn define_tag(
        &mut self,
        key: TagKey,
        default_values: &[String],
        custom_values: Option<&[String]>,
    ) -> ClassificationTag {
        let tag = self.tags.entry(key).or_insert_with(|| ClassificationTag {
            key,
            values: Vec::new(),
            description: None,
        });
        union_into(&mut tag.values, default_values);
        if let Some(custom) = custom_values {
            union_into(&mut tag.values, custom);
        }
        tag.clone()
    }

    /// Add values to an already defined tag
    pub fn extend(&mut self, key: TagKey, values: &[String]) -> Result<&ClassificationTag> {
        let tag = self
            .tags
            .get_mut(&key)
            .ok_or_else(|| GovernanceError::UnknownTagKey(key.to_string()))?;
        union_into(&mut tag.values, values);
        Ok(tag)
    }

    pub fn tag(&self, key: TagKey) -> Option<&ClassificationTag> {
        self.tags.get(&key)
    }

    /// All definitions in key order
    pub fn tags(&self) -> Vec<ClassificationTag> {
        self.tags.values().cloned().collect()
    }

    pub fn validate_value(&self, key: TagKey, value: &str) -> Result<()> {
        let tag = self
            .tags
            .get(&key)
            .ok_or_else(|| GovernanceError::UnknownTagKey(key.to_string()))?;
        if tag.allows(value) {
            Ok(())
        } else {
            Err(GovernanceError::InvalidTagValue {
                key: key.to_string(),
                value: value.to_string(),
                allowed: tag.values.clone(),
            })
        }
    }

    /// Classify a catalog resource.
    ///
    /// Every key must be defined and every value allowed; Environment and PHI
    /// are mandatory.
    pub fn tag_resource<K, V>(
        &self,
        resource: ResourceRef,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<TaggedResource>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tags = BTreeMap::new();
        for (key, value) in pairs {
            let key: TagKey = key.as_ref().parse()?;
            self.validate_value(key, value.as_ref())?;
            if tags.insert(key, value.as_ref().to_string()).is_some() {
                return Err(GovernanceError::config(format!(
                    "tag '{}' given twice for resource '{}'",
                    key, resource
                )));
            }
        }

        for required in TagKey::REQUIRED {
            if !tags.contains_key(&required) {
                return Err(GovernanceError::MissingRequiredTag {
                    resource: resource.to_string(),
                    key: required.to_string(),
                });
            }
        }

        Ok(TaggedResource { resource, tags })
    }

    /// Classify a configured catalog entry. The Environment tag defaults to
    /// the environment being deployed.
    pub fn tag_catalog_entry(&self, entry: &CatalogEntry, environment: &str) -> Result<TaggedResource> {
        let resource = ResourceRef {
            catalog_id: entry.catalog_id.clone(),
            database: entry.database.clone(),
            table: entry.table.clone(),
        };
        let mut pairs = entry.tags.clone();
        pairs
            .entry(TagKey::Environment.to_string())
            .or_insert_with(|| environment.to_string());
        self.tag_resource(resource, pairs)
    }
}
