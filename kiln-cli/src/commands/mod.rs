//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod configuration;
mod run;

pub use configuration::ConfigurationCommands;
pub use run::RunCommands;

use anyhow::{Result, bail};
use clap::Subcommand;
use colored::*;
use kiln_client::OrchestratorClient;
use kiln_core::dto::batch::BatchDeleteResult;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build configuration management
    #[command(alias = "cfg")]
    Config {
        #[command(subcommand)]
        command: ConfigurationCommands,
    },
    /// Run management
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Check that the orchestrator is reachable
    Health,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        Commands::Config { command } => {
            configuration::handle_configuration_command(command, &client).await
        }
        Commands::Run { command } => run::handle_run_command(command, &client, config).await,
        Commands::Health => {
            let health = client.health().await?;
            println!(
                "{} {} ({} active run(s))",
                "✓".green(),
                client.base_url(),
                health.active_runs
            );
            Ok(())
        }
    }
}

/// Prints a batch delete result; fails if any item was refused
fn report_batch_delete(what: &str, result: &BatchDeleteResult) -> Result<()> {
    for id in &result.deleted {
        println!("{}", format!("✓ {} {} deleted", what, id).green().bold());
    }
    for failure in &result.failed {
        println!(
            "{} {} {}: {} ({})",
            "✗".red(),
            what,
            failure.id,
            failure.error,
            failure.code.dimmed()
        );
    }

    if !result.is_complete() {
        let total = result.failed.len() + result.deleted.len();
        bail!("{} of {} deletion(s) failed", result.failed.len(), total);
    }
    Ok(())
}
