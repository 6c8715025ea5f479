//! Kiln CLI
//!
//! Command-line interface for interacting with the Kiln orchestrator.

mod commands;
mod config;
mod id_resolver;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln build orchestration CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "KILN_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    /// Operator recorded on runs started from this CLI
    #[arg(long, env = "KILN_OPERATOR")]
    operator: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::new(cli.orchestrator_url, cli.operator);

    handle_command(cli.command, &config).await
}
