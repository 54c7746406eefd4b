use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lakegov_aws::AwsServices;
use lakegov_core::*;
use lakegov_emulator::{EmulatorBackend, StateExporter};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lakegov")]
#[command(version, about = "Access-control compiler and resource reconciler for a HIPAA data lake")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Governance configuration (YAML, or JSON by extension)
    #[arg(short, long, global = true, default_value = "lakegov.yaml")]
    config: String,

    /// Emulator state file for persistence (optional)
    #[arg(short, long, global = true)]
    state_file: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Emulator,
    Aws,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Summary,
    Sql,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve group mappings into roles and grants
    Resolve {
        #[arg(short, long)]
        env: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Run the compliance battery; exits non-zero when a gating check fails
    Validate {
        #[arg(short, long)]
        env: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Apply tags and grants, then import or create secrets and repositories
    Deploy {
        #[arg(short, long)]
        env: String,
        #[arg(short, long, value_enum, default_value = "emulator")]
        backend: Backend,
        /// Stop after validation
        #[arg(long)]
        dry_run: bool,
        /// Apply even when compliance checks fail
        #[arg(long)]
        allow_noncompliant: bool,
        /// AWS region
        #[arg(long)]
        region: Option<String>,
        /// AWS profile name
        #[arg(long)]
        profile: Option<String>,
        /// Custom endpoint (for testing)
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Show the classification taxonomy and classified resources
    Tags {
        #[arg(short, long)]
        env: String,
    },
    /// Check a role's effective permission in the emulator
    Check {
        /// Role name (e.g. "dev-analysts")
        #[arg(short, long)]
        role: String,
        /// Resource (e.g. "clinical.patients" or "DATABASE clinical")
        #[arg(short = 'R', long)]
        resource: String,
        /// Action to check
        #[arg(short, long)]
        action: String,
        /// Print the per-grant evaluation
        #[arg(long)]
        explain: bool,
    },
    /// Export emulator state
    Export {
        #[arg(short, long, value_enum, default_value = "summary")]
        format: ExportFormat,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(config = %cli.config, state_file = ?cli.state_file, "starting lakegov");

    match cli.command {
        Commands::Resolve { env, format } => {
            let config = LakeConfig::load(&cli.config)?;
            let policy = resolve_environment(&config, &env)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&policy)?),
                Format::Text => print_policy(&policy),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate { env, format } => {
            let config = LakeConfig::load(&cli.config)?;
            let (_, report) = DeploymentDriver::new(&config).plan(&env)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Format::Text => print_report(&report),
            }
            Ok(if report.is_compliant() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Deploy {
            env,
            backend,
            dry_run,
            allow_noncompliant,
            region,
            profile,
            endpoint,
        } => {
            let config = LakeConfig::load(&cli.config)?;
            let backend_config = match backend {
                Backend::Emulator => BackendConfig::Emulator {
                    state_file: cli.state_file.clone(),
                },
                Backend::Aws => BackendConfig::Aws {
                    region: region.or_else(|| config.environment(&env).ok().map(|e| e.region.clone())),
                    profile,
                    endpoint,
                },
            };
            let options = DriverOptions {
                enforce_compliance: !allow_noncompliant,
                dry_run,
            };
            deploy(&config, &env, backend_config, options).await
        }

        Commands::Tags { env } => {
            let config = LakeConfig::load(&cli.config)?;
            let policy = resolve_environment(&config, &env)?;
            print_tags(&policy);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Check {
            role,
            resource,
            action,
            explain,
        } => {
            let backend = EmulatorBackend::new(cli.state_file).await?;
            check_permission(&backend, &role, &resource, &action, explain)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Export { format } => {
            let backend = EmulatorBackend::new(cli.state_file).await?;
            let state = backend.get_state().await;
            match format {
                ExportFormat::Sql => println!("{}", StateExporter::to_sql_ddl(&state)),
                ExportFormat::Summary => println!("{}", StateExporter::to_summary(&state)),
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn deploy(config: &LakeConfig, env: &str, backend: BackendConfig, options: DriverOptions) -> Result<ExitCode> {
    println!("🚀 Deploying environment '{}'{}", env, if options.dry_run { " (dry run)" } else { "" });
    let driver = DeploymentDriver::new(config).with_options(options);

    let outcome = match backend {
        BackendConfig::Emulator { state_file } => {
            let mut emulator = EmulatorBackend::new(state_file).await?;
            let remote = RemoteProviders {
                secrets: emulator.secrets(),
                repositories: emulator.repositories(),
            };
            driver.run(env, &mut emulator, &remote).await?
        }
        BackendConfig::Aws {
            region,
            profile,
            endpoint,
        } => {
            let mut services = AwsServices::connect(env, region, profile, endpoint).await?;
            let remote = services.remote_providers();
            driver.run(env, &mut services.catalog, &remote).await?
        }
    };

    print_report(&outcome.report);
    if options.dry_run {
        println!("🧪 Dry run: {} role(s), {} grant(s) would be applied", outcome.policy.roles.len(), outcome.policy.grants.len());
        return Ok(ExitCode::SUCCESS);
    }

    println!("\n📝 Applied:");
    for result in &outcome.applied {
        match result {
            ApplyResult::Success { message } => println!("  ✅ {}", message),
            ApplyResult::Skipped { reason } => println!("  ⏭️  {}", reason),
        }
    }

    if !outcome.secrets.is_empty() || !outcome.repositories.is_empty() {
        println!("\n📦 Reconciled:");
        for resource in outcome.secrets.iter().chain(outcome.repositories.iter()) {
            let marker = match resource.state {
                ReconcileState::Imported => "📥 Imported",
                ReconcileState::Created => "✨ Created",
            };
            println!("  {} {} {} ({})", marker, resource.kind, resource.qualified_name, resource.reference);
        }
    }
    for container in &outcome.unmapped_containers {
        println!("  ⚠️  Container '{}' has no repository mapping", container);
    }
    for failure in &outcome.failures {
        println!("  ❌ {}", failure);
    }

    Ok(if outcome.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check_permission(
    backend: &EmulatorBackend,
    role: &str,
    resource_str: &str,
    action_str: &str,
    explain: bool,
) -> Result<()> {
    let resource = parse_resource(resource_str)?;
    let action: Action = action_str.parse()?;

    let (allowed, reason) = backend.check_permission_with_reason(role, &resource, &action);
    println!(
        "🔍 {} → {} → {}: {}",
        role,
        action,
        resource,
        if allowed { "✅ ALLOWED" } else { "❌ DENIED" }
    );
    if explain {
        println!("{}", reason);
    }
    Ok(())
}

fn parse_resource(s: &str) -> Result<ResourceRef> {
    let s = s.trim();
    if let Some(name) = s.strip_prefix("DATABASE ") {
        return Ok(ResourceRef::database(name.trim()));
    }
    match s.split_once('.') {
        Some((database, table)) if !database.is_empty() && !table.is_empty() && !table.contains('.') => {
            Ok(ResourceRef::table(database, table))
        }
        None if !s.is_empty() && !s.contains(' ') => Ok(ResourceRef::database(s)),
        _ => Err(anyhow!("Invalid resource format: {}", s)),
    }
}

fn conditions(grant: &PermissionGrant) -> String {
    if grant.tag_conditions.is_empty() {
        return String::new();
    }
    let joined = grant
        .tag_conditions
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" [{}]", joined)
}

fn print_policy(policy: &ResolvedPolicySet) {
    println!(
        "🧭 Resolved policy for '{}' ({})",
        policy.environment,
        if policy.is_production { "production" } else { "non-production" }
    );

    println!("\n👥 Roles:");
    for role in &policy.roles {
        let trust = match &role.trust {
            Some(trust) => format!("trusts {}", trust.group_ids.join(", ")),
            None => "⚠️ no trust condition".to_string(),
        };
        println!("  • {} ({}) {}", role.name, role.group_name, trust);
    }

    println!("\n🔐 Grants:");
    for (i, grant) in policy.grants.iter().enumerate() {
        let actions = grant.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ");
        println!(
            "  {}. {} → {} → {}{}{}",
            i + 1,
            grant.role,
            actions,
            grant.resource,
            conditions(grant),
            if grant.grant_option { " WITH GRANT OPTION" } else { "" }
        );
    }

    if !policy.warnings.is_empty() {
        println!("\n⚠️  Warnings:");
        for warning in &policy.warnings {
            println!("  • {}", warning);
        }
    }
}

fn print_report(report: &ComplianceReport) {
    println!("🛡️  Compliance report for '{}'", report.environment);
    for check in &report.checks {
        let marker = match (check.passed, check.advisory) {
            (true, _) => "✅",
            (false, true) => "⚠️",
            (false, false) => "❌",
        };
        println!("  {} {}: {}", marker, check.name, check.description);
        for finding in &check.findings {
            println!("      ↳ {}", finding.message);
        }
    }
    let advisories = report.advisories();
    if !advisories.is_empty() {
        println!("⚠️  Advisory: {}", advisories.join(", "));
    }
    if report.is_compliant() {
        let gating = report.checks.iter().filter(|c| !c.advisory).count();
        println!("🎉 All {} gating checks passed", gating);
    } else {
        println!("🚫 Failed: {}", report.failed().join(", "));
    }
}

fn print_tags(policy: &ResolvedPolicySet) {
    println!("🏷️  Classification tags for '{}':", policy.environment);
    for tag in &policy.tags {
        println!("  • {}: {}", tag.key, tag.values.join(", "));
    }

    if !policy.resources.is_empty() {
        println!("\n🗄️  Classified resources:");
        for resource in &policy.resources {
            let tags = resource
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  • {}: {}", resource.resource, tags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource() {
        assert_eq!(parse_resource("DATABASE clinical").unwrap(), ResourceRef::database("clinical"));
        assert_eq!(parse_resource("clinical").unwrap(), ResourceRef::database("clinical"));
        assert_eq!(
            parse_resource("clinical.patients").unwrap(),
            ResourceRef::table("clinical", "patients")
        );
        assert!(parse_resource("a.b.c").is_err());
        assert!(parse_resource("").is_err());
    }
}
