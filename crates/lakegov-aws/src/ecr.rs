//! ECR remote-resource provider

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecr::error::DisplayErrorContext;
use aws_sdk_ecr::types::{ImageScanningConfiguration, Tag};
use aws_sdk_ecr::Client;
use lakegov_core::*;

pub struct EcrRepositories {
    client: Client,
}

impl EcrRepositories {
    pub fn from_sdk_config(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut config = aws_sdk_ecr::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint);
        }
        Self {
            client: Client::from_conf(config.build()),
        }
    }
}

#[async_trait]
impl RemoteResourceProvider for EcrRepositories {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    async fn probe(&self, name: &str) -> ProbeOutcome {
        match self.client.describe_repositories().repository_names(name).send().await {
            Ok(output) => match output.repositories().first().and_then(|r| r.repository_uri()) {
                Some(uri) => ProbeOutcome::Exists(uri.to_string()),
                None => ProbeOutcome::NotFound,
            },
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|s| s.is_repository_not_found_exception())
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
        let tags = defaults
            .tags
            .iter()
            .map(|(key, value)| {
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(|e| anyhow!("Failed to build repository tag: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .create_repository()
            .repository_name(name)
            .image_scanning_configuration(ImageScanningConfiguration::builder().scan_on_push(true).build())
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create repository '{}': {}", name, DisplayErrorContext(&e)))?;

        output
            .repository()
            .and_then(|r| r.repository_uri())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ECR returned no URI for repository '{}'", name))
    }
}
