//! Configuration command handlers
//!
//! Creating, editing and inspecting build configurations, plus their
//! webhook tokens and trigger audit trail.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use kiln_client::OrchestratorClient;
use kiln_core::domain::configuration::BuildConfiguration;
use kiln_core::domain::trigger::{TriggerEvent, TriggerOutcome};
use kiln_core::dto::configuration::{
    ConfigurationQuery, CreateConfiguration, TriggerSettings, TriggerUrl,
};

use crate::id_resolver::resolve_configuration_id;

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigurationCommands {
    /// Create a configuration from a JSON file
    Create {
        /// Path to a JSON configuration document
        #[arg(short, long)]
        file: String,

        /// Override the name from the file
        #[arg(short, long)]
        name: Option<String>,

        /// Override the group from the file
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Replace a configuration with the contents of a JSON file
    Update {
        /// Configuration name, ID or unambiguous prefix
        id: String,

        #[arg(short, long)]
        file: String,
    },
    /// List configurations
    List {
        /// Only configurations of this group
        #[arg(short, long)]
        group: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// List configuration groups
    Groups,
    /// Show configuration details
    Get { id: String },
    /// Delete configurations and their run history
    Delete {
        /// One or more configuration names, IDs or prefixes
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Accept triggers again
    Enable { id: String },
    /// Reject every trigger until enabled
    Disable { id: String },
    /// Show the webhook trigger URL
    TriggerUrl { id: String },
    /// Issue a new webhook token, invalidating the old URL
    ResetToken { id: String },
    /// Show the trigger audit trail
    Triggers {
        id: String,

        #[arg(long, default_value = "1")]
        page: u32,
    },
}

/// Handle configuration commands
pub async fn handle_configuration_command(
    command: ConfigurationCommands,
    client: &OrchestratorClient,
) -> Result<()> {
    match command {
        ConfigurationCommands::Create { file, name, group } => {
            create_configuration(client, &file, name, group).await
        }
        ConfigurationCommands::Update { id, file } => update_configuration(client, &id, &file).await,
        ConfigurationCommands::List { group, page } => list_configurations(client, group, page).await,
        ConfigurationCommands::Groups => list_groups(client).await,
        ConfigurationCommands::Get { id } => get_configuration(client, &id).await,
        ConfigurationCommands::Delete { ids } => delete_configurations(client, &ids).await,
        ConfigurationCommands::Enable { id } => set_enabled(client, &id, true).await,
        ConfigurationCommands::Disable { id } => set_enabled(client, &id, false).await,
        ConfigurationCommands::TriggerUrl { id } => {
            let uuid = resolve_configuration_id(client, &id).await?;
            let url = client.trigger_url(uuid).await?;
            print_trigger_url(client, &url);
            Ok(())
        }
        ConfigurationCommands::ResetToken { id } => {
            let uuid = resolve_configuration_id(client, &id).await?;
            let url = client.reset_token(uuid).await?;
            println!("{}", "✓ Webhook token replaced".green().bold());
            print_trigger_url(client, &url);
            Ok(())
        }
        ConfigurationCommands::Triggers { id, page } => list_triggers(client, &id, page).await,
    }
}

/// Read a configuration document from disk
fn read_request(path: &str) -> Result<CreateConfiguration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid configuration document: {}", path))
}

async fn create_configuration(
    client: &OrchestratorClient,
    path: &str,
    name: Option<String>,
    group: Option<String>,
) -> Result<()> {
    let mut req = read_request(path)?;
    if let Some(name) = name {
        req.name = name;
    }
    if group.is_some() {
        req.group = group;
    }

    let config = client.create_configuration(req).await?;

    println!("{}", "✓ Configuration created successfully!".green().bold());
    println!("  ID:   {}", config.id.to_string().cyan());
    println!("  Name: {}", config.name.bold());
    if config.triggers.webhook_token.is_some() {
        let url = client.trigger_url(config.id).await?;
        print_trigger_url(client, &url);
    }

    Ok(())
}

async fn update_configuration(client: &OrchestratorClient, id: &str, path: &str) -> Result<()> {
    let uuid = resolve_configuration_id(client, id).await?;
    let req = read_request(path)?;

    let config = client.update_configuration(uuid, req).await?;

    println!(
        "{}",
        format!("✓ Configuration {} updated", config.name).green().bold()
    );
    Ok(())
}

async fn list_configurations(
    client: &OrchestratorClient,
    group: Option<String>,
    page: u32,
) -> Result<()> {
    let query = ConfigurationQuery {
        group,
        page: Some(page),
        page_size: None,
    };
    let result = client.list_configurations(&query).await?;

    if result.items.is_empty() {
        println!("{}", "No configurations found.".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Found {} configuration(s):", result.total).bold()
    );
    println!();
    for config in &result.items {
        print_configuration_summary(config);
    }
    if result.has_more() {
        println!("{}", format!("More on page {}", result.page + 1).dimmed());
    }

    Ok(())
}

async fn list_groups(client: &OrchestratorClient) -> Result<()> {
    let groups = client.list_groups().await?;

    if groups.is_empty() {
        println!("{}", "No groups defined.".yellow());
    }
    for group in groups {
        println!("  {} {}", "▸".cyan(), group);
    }
    Ok(())
}

async fn get_configuration(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_configuration_id(client, id).await?;
    let config = client.get_configuration(uuid).await?;

    print_configuration_details(&config);
    Ok(())
}

async fn delete_configurations(client: &OrchestratorClient, ids: &[String]) -> Result<()> {
    let mut uuids = Vec::with_capacity(ids.len());
    for id in ids {
        uuids.push(resolve_configuration_id(client, id).await?);
    }

    if let [uuid] = uuids[..] {
        client.delete_configuration(uuid).await?;
        println!(
            "{}",
            format!("✓ Configuration {} deleted", uuid).green().bold()
        );
        return Ok(());
    }

    let result = client.delete_configurations(uuids).await?;
    super::report_batch_delete("Configuration", &result)
}

async fn set_enabled(client: &OrchestratorClient, id: &str, enabled: bool) -> Result<()> {
    let uuid = resolve_configuration_id(client, id).await?;
    let config = client.get_configuration(uuid).await?;

    let mut req = to_request(&config);
    req.triggers.enabled = enabled;
    let config = client.update_configuration(uuid, req).await?;

    let state = if enabled { "enabled" } else { "disabled" };
    println!(
        "{}",
        format!("✓ Configuration {} {}", config.name, state).green().bold()
    );
    Ok(())
}

async fn list_triggers(client: &OrchestratorClient, id: &str, page: u32) -> Result<()> {
    let uuid = resolve_configuration_id(client, id).await?;
    let events = client.list_trigger_events(uuid, Some(page), None).await?;

    if events.items.is_empty() {
        println!("{}", "No trigger events recorded.".yellow());
        return Ok(());
    }
    for event in &events.items {
        print_trigger_event(event);
    }
    Ok(())
}

/// Editable fields of a stored configuration
///
/// The webhook flag keeps the existing token; the orchestrator only issues a
/// new one on reset.
fn to_request(config: &BuildConfiguration) -> CreateConfiguration {
    CreateConfiguration {
        name: config.name.clone(),
        group: config.group.clone(),
        source: config.source.clone(),
        script: config.script.clone(),
        result_path: config.result_path.clone(),
        release: config.release.clone(),
        retention_days: config.retention_days,
        triggers: TriggerSettings {
            enabled: config.triggers.enabled,
            cron: config.triggers.cron.clone(),
            webhook: config.triggers.webhook_token.is_some(),
        },
        env_vars: config.env_vars.clone(),
        timeouts: config.timeouts.clone(),
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_trigger_url(client: &OrchestratorClient, url: &TriggerUrl) {
    println!("  Trigger URL: POST {}{}", client.base_url(), url.path.cyan());
    println!("  Header:      Authorization: Bearer {}", url.token.yellow());
}

fn print_configuration_summary(config: &BuildConfiguration) {
    let state = if config.triggers.enabled {
        "enabled".green()
    } else {
        "disabled".red()
    };

    println!("  {} {} [{}]", "▸".cyan(), config.name.bold(), state);
    println!("    ID:     {}", config.id.to_string().dimmed());
    if let Some(group) = &config.group {
        println!("    Group:  {}", group.dimmed());
    }
    println!("    Source: {}", config.source.repository.dimmed());
    if let Some(cron) = &config.triggers.cron {
        println!("    Cron:   {}", cron.dimmed());
    }
    println!();
}

fn print_configuration_details(config: &BuildConfiguration) {
    println!("{}", "Configuration Details:".bold());
    println!("  ID:          {}", config.id.to_string().cyan());
    println!("  Name:        {}", config.name.bold());
    if let Some(group) = &config.group {
        println!("  Group:       {}", group);
    }
    println!("  Repository:  {}", config.source.repository);
    if let Some(revision) = config.source.revision() {
        println!("  Revision:    {}", revision);
    }
    println!("  Result:      {}", config.result_path);
    println!("  Release:     {}", config.release.kind());
    match config.retention_days {
        Some(days) => println!("  Retention:   {} day(s)", days),
        None => println!("  Retention:   forever"),
    }
    println!(
        "  Enabled:     {}",
        if config.triggers.enabled { "✓".green() } else { "✗".red() }
    );
    if let Some(cron) = &config.triggers.cron {
        println!("  Cron:        {}", cron);
    }
    println!(
        "  Webhook:     {}",
        if config.triggers.webhook_token.is_some() { "✓".green() } else { "✗".dimmed() }
    );
    println!(
        "  Updated:     {}",
        config.updated_at.format("%Y-%m-%d %H:%M:%S")
    );

    if !config.env_vars.is_empty() {
        println!("\n{}", "Environment:".bold());
        let mut vars: Vec<_> = config.env_vars.iter().collect();
        vars.sort();
        for (key, value) in vars {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    println!("\n{}", "Script:".bold());
    println!("{}", "─".repeat(80).dimmed());
    println!("{}", config.script);
    println!("{}", "─".repeat(80).dimmed());
}

fn print_trigger_event(event: &TriggerEvent) {
    let outcome = match event.outcome {
        TriggerOutcome::Accepted => "accepted".green(),
        TriggerOutcome::Skipped => "skipped".yellow(),
        TriggerOutcome::Rejected => "rejected".red(),
    };

    print!(
        "  {} {:<9} {:<8} {}",
        event.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        event.trigger.source.to_string(),
        outcome,
        event.trigger.identity
    );
    if let Some(run_id) = event.run_id {
        print!(" {}", run_id.to_string().dimmed());
    }
    if let Some(detail) = &event.detail {
        print!(" ({})", detail);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::configuration::{SourceRef, StageTimeouts, TriggerPolicy};
    use kiln_core::domain::release::ReleaseMethod;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_to_request_keeps_webhook_and_schedule() {
        let now = chrono::Utc::now();
        let config = BuildConfiguration {
            id: Uuid::new_v4(),
            name: "web".to_string(),
            group: Some("frontend".to_string()),
            source: SourceRef {
                repository: "https://example.com/web.git".to_string(),
                branch: Some("main".to_string()),
                tag: None,
            },
            script: "make".to_string(),
            result_path: "dist".to_string(),
            release: ReleaseMethod::None,
            retention_days: Some(3),
            triggers: TriggerPolicy {
                enabled: true,
                cron: Some("0 3 * * *".to_string()),
                webhook_token: Some("secret".to_string()),
            },
            env_vars: HashMap::from([("MODE".to_string(), "prod".to_string())]),
            timeouts: StageTimeouts::default(),
            created_at: now,
            updated_at: now,
        };

        let req = to_request(&config);
        assert!(req.triggers.webhook);
        assert_eq!(req.triggers.cron.as_deref(), Some("0 3 * * *"));
        assert_eq!(req.group.as_deref(), Some("frontend"));
        assert_eq!(req.env_vars["MODE"], "prod");
    }

    #[test]
    fn test_request_document_defaults() {
        let req: CreateConfiguration = serde_json::from_str(
            r#"{
                "name": "api",
                "source": { "repository": "https://example.com/api.git", "branch": null, "tag": "v1.0" },
                "script": "cargo build --release",
                "result_path": "target/release/api"
            }"#,
        )
        .unwrap();
        assert!(req.triggers.enabled);
        assert!(!req.triggers.webhook);
        assert_eq!(req.release, ReleaseMethod::None);
    }
}
