//! Persistent storage for the emulator

use crate::EmulatorState;
use anyhow::{Context, Result};
use lakegov_core::*;
use std::path::Path;

/// Storage backend for emulator state
#[derive(Debug)]
pub struct FileStorage {
    file_path: String,
}

impl FileStorage {
    pub fn new(file_path: String) -> Self {
        Self { file_path }
    }

    pub fn path(&self) -> &str {
        &self.file_path
    }

    /// Load state from file
    pub async fn load(&self) -> Result<EmulatorState> {
        if !self.exists() {
            return Ok(EmulatorState::new());
        }

        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("failed to read emulator state {}", self.file_path))?;
        let state: EmulatorState = serde_json::from_str(&content)
            .with_context(|| format!("emulator state {} is not valid JSON", self.file_path))?;
        Ok(state)
    }

    /// Save state to file
    pub async fn save(&self, state: &EmulatorState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;

        if let Some(parent) = Path::new(&self.file_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&self.file_path, content).await?;
        tracing::debug!(path = %self.file_path, "saved emulator state");
        Ok(())
    }

    /// Check if storage file exists
    pub fn exists(&self) -> bool {
        Path::new(&self.file_path).exists()
    }
}

fn quoted(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn condition_sql(condition: &TagCondition) -> String {
    match condition {
        TagCondition::NotEquals { key, value } => format!("{} != '{}'", key, value),
        TagCondition::In { key, values } => format!("{} IN ({})", key, quoted(values)),
    }
}

/// Export state to different formats
pub struct StateExporter;

impl StateExporter {
    /// Export state as SQL-like DDL statements
    pub fn to_sql_ddl(state: &EmulatorState) -> String {
        let mut sql = String::new();
        sql.push_str("-- Data lake governance state export\n");
        sql.push_str("-- Generated DDL statements to recreate this state\n\n");

        for tag in state.tags.values() {
            sql.push_str(&format!("CREATE TAG {} VALUES ({});\n", tag.key, quoted(&tag.values)));
        }
        sql.push('\n');

        for resource in &state.resources {
            let tags = resource
                .tags
                .iter()
                .map(|(k, v)| format!("{}='{}'", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            let kind = if resource.resource.table.is_some() { "TABLE" } else { "DATABASE" };
            sql.push_str(&format!("ALTER {} {} SET TAGS ({});\n", kind, resource.resource, tags));
        }
        sql.push('\n');

        for role in state.roles.keys() {
            sql.push_str(&format!("CREATE ROLE {};\n", role));
        }
        sql.push('\n');

        for grant in &state.grants {
            let actions = grant
                .actions
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(", ");

            let resource = match &grant.resource {
                Resource::Catalog => "CATALOG".to_string(),
                Resource::Database { name } => format!("DATABASE {}", name),
                Resource::TableWildcard { database } => format!("ALL TABLES IN {}", database),
                Resource::Table { database, table } => format!("{}.{}", database, table),
            };

            let conditions = if grant.tag_conditions.is_empty() {
                String::new()
            } else {
                let joined = grant
                    .tag_conditions
                    .iter()
                    .map(condition_sql)
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!(" WHERE TAGS {}", joined)
            };

            let grant_option = if grant.grant_option { " WITH GRANT OPTION" } else { "" };

            sql.push_str(&format!(
                "GRANT {} ON {} TO ROLE {}{}{};\n",
                actions, resource, grant.role, conditions, grant_option
            ));
        }

        sql
    }

    /// Export state as a human-readable summary
    pub fn to_summary(state: &EmulatorState) -> String {
        let mut summary = String::new();
        summary.push_str("🦀 Data Lake Governance State Summary\n");
        summary.push_str("=====================================\n\n");

        summary.push_str("📊 **Statistics:**\n");
        summary.push_str(&format!("- Tags: {}\n", state.tags.len()));
        summary.push_str(&format!("- Tagged resources: {}\n", state.resources.len()));
        summary.push_str(&format!("- Roles: {}\n", state.roles.len()));
        summary.push_str(&format!("- Grants: {}\n", state.grants.len()));
        summary.push_str(&format!("- Secrets: {}\n", state.secrets.len()));
        summary.push_str(&format!("- Repositories: {}\n\n", state.repositories.len()));

        if !state.roles.is_empty() {
            summary.push_str("👥 **Roles:**\n");
            for role in state.roles.values() {
                let trust = match &role.trust {
                    Some(trust) => format!("groups {:?}", trust.group_ids),
                    None => "no trust condition".to_string(),
                };
                summary.push_str(&format!("- {} ({}): {}\n", role.name, role.group_name, trust));
            }
            summary.push('\n');
        }

        if !state.tags.is_empty() {
            summary.push_str("🏷️ **Tags:**\n");
            for tag in state.tags.values() {
                summary.push_str(&format!("- {}: {:?}\n", tag.key, tag.values));
            }
            summary.push('\n');
        }

        if !state.grants.is_empty() {
            summary.push_str("🔐 **Grants:**\n");
            for (i, grant) in state.grants.iter().enumerate() {
                let conditions = grant
                    .tag_conditions
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" AND ");
                summary.push_str(&format!(
                    "{}. {} → {:?} → {}{}\n",
                    i + 1,
                    grant.role,
                    grant.actions,
                    grant.resource,
                    if conditions.is_empty() { String::new() } else { format!(" [{}]", conditions) }
                ));
            }
            summary.push('\n');
        }

        if !state.secrets.is_empty() || !state.repositories.is_empty() {
            summary.push_str("📦 **Reconciled resources:**\n");
            for name in state.secrets.keys() {
                summary.push_str(&format!("- secret {}\n", name));
            }
            for (name, repository) in &state.repositories {
                summary.push_str(&format!("- repository {} ({})\n", name, repository.uri));
            }
        }

        summary
    }
}
