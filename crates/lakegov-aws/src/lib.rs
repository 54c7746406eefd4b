//! # AWS providers
//!
//! Lake Formation catalog provider plus Secrets Manager and ECR
//! remote-resource providers for production deployments.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_lakeformation::error::DisplayErrorContext;
use aws_sdk_lakeformation::types::{
    DataLakePrincipal, DatabaseResource, LfTag as AwsLfTag, LfTagPair, LfTagPolicyResource, Resource as LfResource,
    ResourceType, TableResource, TableWildcard,
};
use aws_sdk_lakeformation::Client;
use lakegov_core::*;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod ecr;
pub mod plan;
pub mod secrets;

pub use ecr::EcrRepositories;
pub use plan::{plan_grant, ExpressionScope, GrantTarget, PlannedGrant};
pub use secrets::SecretsManagerStore;

/// Load shared SDK configuration
pub async fn load_sdk_config(region: Option<String>, profile: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    if let Some(profile) = profile {
        loader = loader.profile_name(&profile);
    }

    loader.load().await
}

/// Every AWS provider a deployment needs
pub struct AwsServices {
    pub catalog: AwsCatalog,
    pub secrets: Arc<SecretsManagerStore>,
    pub repositories: Arc<EcrRepositories>,
}

impl AwsServices {
    /// Create all providers from one configuration. The endpoint override
    /// (for LocalStack testing) applies to every client.
    pub async fn connect(
        environment: &str,
        region: Option<String>,
        profile: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let sdk_config = load_sdk_config(region, profile).await;
        if sdk_config.region().is_none() {
            bail!("no AWS region configured; pass --region or set AWS_REGION");
        }

        Ok(Self {
            catalog: AwsCatalog::from_sdk_config(&sdk_config, endpoint.as_deref(), environment),
            secrets: Arc::new(SecretsManagerStore::from_sdk_config(&sdk_config, endpoint.as_deref())),
            repositories: Arc::new(EcrRepositories::from_sdk_config(&sdk_config, endpoint.as_deref())),
        })
    }

    pub fn remote_providers(&self) -> RemoteProviders {
        RemoteProviders {
            secrets: self.secrets.clone(),
            repositories: self.repositories.clone(),
        }
    }
}

/// AWS Lake Formation catalog provider
pub struct AwsCatalog {
    client: Client,
    catalog_id: Option<String>,
    /// Environment tag value every tag-expression grant is pinned to
    environment: String,
    /// Tag values known to be defined, for building LF-tag expressions
    defined: BTreeMap<TagKey, Vec<String>>,
    /// Resources classified during this run
    known: PermissionEngine,
}

impl AwsCatalog {
    pub fn from_sdk_config(sdk_config: &SdkConfig, endpoint: Option<&str>, environment: &str) -> Self {
        let mut config = aws_sdk_lakeformation::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(config.build()),
            catalog_id: None,
            environment: environment.to_string(),
            defined: BTreeMap::new(),
            known: PermissionEngine::new(),
        }
    }

    /// Target a catalog other than the caller's account
    pub fn with_catalog_id(mut self, catalog_id: impl Into<String>) -> Self {
        self.catalog_id = Some(catalog_id.into());
        self
    }

    fn record_values(&mut self, key: TagKey, values: &[String]) {
        let defined = self.defined.entry(key).or_default();
        for value in values {
            if !defined.contains(value) {
                defined.push(value.clone());
            }
        }
    }

    async fn create_tag(&mut self, tag: &ClassificationTag) -> Result<ApplyResult> {
        self.client
            .create_lf_tag()
            .set_catalog_id(self.catalog_id.clone())
            .tag_key(tag.key.as_str())
            .set_tag_values(Some(tag.values.clone()))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create LF-Tag '{}': {}", tag.key, DisplayErrorContext(&e)))?;

        self.record_values(tag.key, &tag.values);
        Ok(ApplyResult::Success {
            message: format!("Created LF-Tag '{}' with {} value(s)", tag.key, tag.values.len()),
        })
    }
}

fn principal(role: &Role) -> DataLakePrincipal {
    DataLakePrincipal::builder()
        .data_lake_principal_identifier(&role.arn)
        .build()
}

fn catalog_resource(resource: &ResourceRef, catalog_id: Option<String>) -> Result<LfResource> {
    let catalog_id = resource.catalog_id.clone().or(catalog_id);
    match &resource.table {
        None => Ok(LfResource::builder()
            .database(
                DatabaseResource::builder()
                    .set_catalog_id(catalog_id)
                    .name(&resource.database)
                    .build()
                    .map_err(|e| anyhow!("Failed to build database resource: {}", e))?,
            )
            .build()),
        Some(table) => Ok(LfResource::builder()
            .table(
                TableResource::builder()
                    .set_catalog_id(catalog_id)
                    .database_name(&resource.database)
                    .name(table)
                    .build()
                    .map_err(|e| anyhow!("Failed to build table resource: {}", e))?,
            )
            .build()),
    }
}

/// Convert a planned grant target to a Lake Formation resource
pub fn target_resource(target: &GrantTarget, catalog_id: Option<String>) -> Result<LfResource> {
    match target {
        GrantTarget::Database(name) => catalog_resource(&ResourceRef::database(name.as_str()), catalog_id),
        GrantTarget::Table { database, table } => {
            catalog_resource(&ResourceRef::table(database.as_str(), table.as_str()), catalog_id)
        }
        GrantTarget::AllTables(database) => Ok(LfResource::builder()
            .table(
                TableResource::builder()
                    .set_catalog_id(catalog_id)
                    .database_name(database)
                    .table_wildcard(TableWildcard::builder().build())
                    .build()
                    .map_err(|e| anyhow!("Failed to build table wildcard resource: {}", e))?,
            )
            .build()),
        GrantTarget::TagExpression { scope, expression } => {
            let tags = expression
                .iter()
                .map(|(key, values)| {
                    AwsLfTag::builder()
                        .tag_key(key.as_str())
                        .set_tag_values(Some(values.clone()))
                        .build()
                        .map_err(|e| anyhow!("Failed to build LF-Tag expression: {}", e))
                })
                .collect::<Result<Vec<_>>>()?;
            let resource_type = match scope {
                ExpressionScope::Database => ResourceType::Database,
                ExpressionScope::Table => ResourceType::Table,
            };
            Ok(LfResource::builder()
                .lf_tag_policy(
                    LfTagPolicyResource::builder()
                        .set_catalog_id(catalog_id)
                        .resource_type(resource_type)
                        .set_expression(Some(tags))
                        .build()
                        .map_err(|e| anyhow!("Failed to build LF-Tag policy: {}", e))?,
                )
                .build())
        }
    }
}

#[async_trait]
impl CatalogProvider for AwsCatalog {
    async fn define_tag(&mut self, tag: &ClassificationTag) -> Result<ApplyResult> {
        let key = tag.key.as_str();
        let existing = match self
            .client
            .get_lf_tag()
            .set_catalog_id(self.catalog_id.clone())
            .tag_key(key)
            .send()
            .await
        {
            Ok(output) => output.tag_values().to_vec(),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|s| s.is_entity_not_found_exception())
                    .unwrap_or(false);
                if not_found {
                    return self.create_tag(tag).await;
                }
                bail!("Failed to read LF-Tag '{}': {}", key, DisplayErrorContext(&e));
            }
        };
        self.record_values(tag.key, &existing);

        // Values are only ever added; extra remote values are left alone
        let missing: Vec<String> = tag
            .values
            .iter()
            .filter(|v| !existing.contains(v))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(ApplyResult::Skipped {
                reason: format!("LF-Tag '{}' already defines every value", key),
            });
        }

        self.client
            .update_lf_tag()
            .set_catalog_id(self.catalog_id.clone())
            .tag_key(key)
            .set_tag_values_to_add(Some(missing.clone()))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to update LF-Tag '{}': {}", key, DisplayErrorContext(&e)))?;

        self.record_values(tag.key, &missing);
        Ok(ApplyResult::Success {
            message: format!("Added {:?} to LF-Tag '{}'", missing, key),
        })
    }

    async fn tag_resource(&mut self, resource: &TaggedResource) -> Result<ApplyResult> {
        let lf_resource = catalog_resource(&resource.resource, self.catalog_id.clone())?;
        let pairs = resource
            .tags
            .iter()
            .map(|(key, value)| {
                LfTagPair::builder()
                    .set_catalog_id(self.catalog_id.clone())
                    .tag_key(key.as_str())
                    .tag_values(value.clone())
                    .build()
                    .map_err(|e| anyhow!("Failed to build LF-Tag pair: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .add_lf_tags_to_resource()
            .set_catalog_id(self.catalog_id.clone())
            .resource(lf_resource)
            .set_lf_tags(Some(pairs))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to tag {}: {}", resource.resource, DisplayErrorContext(&e)))?;

        if !output.failures().is_empty() {
            bail!("Failed to tag {}: {:?}", resource.resource, output.failures());
        }

        self.known.tag_resource(resource);
        Ok(ApplyResult::Success {
            message: format!("Tagged {} with {} LF-Tag(s)", resource.resource, resource.tags.len()),
        })
    }

    async fn grant_permissions(&mut self, role: &Role, grant: &PermissionGrant) -> Result<ApplyResult> {
        let planned = plan_grant(grant, &self.environment, &self.known, &self.defined);
        if planned.is_empty() {
            return Ok(ApplyResult::Skipped {
                reason: format!(
                    "no classified resource satisfies the conditions of {} on {}",
                    role.name, grant.resource
                ),
            });
        }

        for plan in &planned {
            let grantable = if plan.grantable.is_empty() {
                None
            } else {
                Some(plan.grantable.clone())
            };
            self.client
                .grant_permissions()
                .set_catalog_id(self.catalog_id.clone())
                .principal(principal(role))
                .resource(target_resource(&plan.target, self.catalog_id.clone())?)
                .set_permissions(Some(plan.permissions.clone()))
                .set_permissions_with_grant_option(grantable)
                .send()
                .await
                .map_err(|e| {
                    anyhow!(
                        "Failed to grant {:?} to {}: {}",
                        plan.permissions,
                        role.name,
                        DisplayErrorContext(&e)
                    )
                })?;
            tracing::debug!(role = %role.name, target = ?plan.target, "granted Lake Formation permissions");
        }

        Ok(ApplyResult::Success {
            message: format!(
                "Granted {} Lake Formation permission set(s) on {} to {}",
                planned.len(),
                grant.resource,
                role.name
            ),
        })
    }
}
