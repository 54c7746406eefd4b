//! Secrets Manager remote-resource provider

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::types::Tag;
use aws_sdk_secretsmanager::Client;
use lakegov_core::*;

const GENERATED_PASSWORD_LENGTH: i64 = 32;

pub struct SecretsManagerStore {
    client: Client,
}

impl SecretsManagerStore {
    pub fn from_sdk_config(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut config = aws_sdk_secretsmanager::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint);
        }
        Self {
            client: Client::from_conf(config.build()),
        }
    }

    async fn generate_value(&self) -> Result<String> {
        let output = self
            .client
            .get_random_password()
            .password_length(GENERATED_PASSWORD_LENGTH)
            .exclude_punctuation(true)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to generate secret value: {}", DisplayErrorContext(&e)))?;
        output
            .random_password()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Secrets Manager returned no random password"))
    }
}

fn tags(defaults: &CreateDefaults) -> Vec<Tag> {
    defaults
        .tags
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

/// A secret pending deletion stops resolving once its recovery window ends,
/// so it is neither importable nor absent.
fn describe_outcome(name: &str, arn: Option<&str>, scheduled_for_deletion: bool) -> ProbeOutcome {
    if scheduled_for_deletion {
        tracing::warn!(secret = name, "secret is scheduled for deletion");
        return ProbeOutcome::ProbeError(format!("secret '{}' is scheduled for deletion", name));
    }
    ProbeOutcome::Exists(arn.unwrap_or(name).to_string())
}

#[async_trait]
impl RemoteResourceProvider for SecretsManagerStore {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Secret
    }

    async fn probe(&self, name: &str) -> ProbeOutcome {
        match self.client.describe_secret().secret_id(name).send().await {
            Ok(output) => describe_outcome(name, output.arn(), output.deleted_date().is_some()),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|s| s.is_resource_not_found_exception())
                    .unwrap_or(false);
                if not_found {
                    ProbeOutcome::NotFound
                } else {
                    ProbeOutcome::ProbeError(DisplayErrorContext(&e).to_string())
                }
            }
        }
    }

    async fn create(&self, name: &str, defaults: &CreateDefaults) -> Result<String> {
        let value = match &defaults.payload {
            Some(value) => value.clone(),
            None => self.generate_value().await?,
        };

        let output = self
            .client
            .create_secret()
            .name(name)
            .set_description(defaults.description.clone())
            .secret_string(value)
            .set_tags(Some(tags(defaults)))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create secret '{}': {}", name, DisplayErrorContext(&e)))?;

        Ok(output.arn().unwrap_or(name).to_string())
    }
}
