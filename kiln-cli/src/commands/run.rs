//! Run command handlers
//!
//! Starting, following, cancelling and rolling back runs, plus log and
//! artifact download.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use kiln_client::OrchestratorClient;
use kiln_core::domain::run::{Run, RunKind, RunStatus};
use kiln_core::dto::run::RunQuery;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::{resolve_configuration_id, resolve_run_id};

/// Pause between log polls when nothing new was written
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a run of a configuration
    Start {
        /// Configuration name, ID or unambiguous prefix
        configuration: String,

        /// Build this branch instead of the configured ref
        #[arg(short, long)]
        branch: Option<String>,

        /// Stream the log until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Request cancellation of a run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Show run details
    Status { id: String },
    /// List run history, newest first
    List {
        /// Only runs of this configuration
        #[arg(short, long)]
        configuration: Option<String>,

        /// Only runs in this status (e.g. failed, succeeded)
        #[arg(short, long)]
        status: Option<RunStatus>,

        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// Print a run's console output
    Logs {
        id: String,

        /// Keep polling until the run finishes
        #[arg(short, long)]
        follow: bool,

        /// First line to print (1-based)
        #[arg(long, default_value = "1")]
        from: u64,
    },
    /// Redeploy the artifact of a past run
    Rollback {
        id: String,

        #[arg(short, long)]
        follow: bool,
    },
    /// Delete finished runs with their logs and artifacts
    Delete {
        /// One or more run IDs or prefixes
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List artifact files, or download one
    Artifact {
        /// Run ID, or the configuration when `--number` is given
        id: String,

        /// Address the run by its number within the configuration
        #[arg(short, long)]
        number: Option<i64>,

        /// File inside the artifact to download
        #[arg(long)]
        file: Option<String>,

        /// Where to write the downloaded file
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Handle run commands
pub async fn handle_run_command(
    command: RunCommands,
    client: &OrchestratorClient,
    config: &Config,
) -> Result<()> {
    match command {
        RunCommands::Start {
            configuration,
            branch,
            follow,
        } => start_run(client, config, &configuration, branch, follow).await,
        RunCommands::Cancel { id } => {
            let uuid = resolve_run_id(client, &id, None).await?;
            client.cancel_run(uuid).await?;
            println!(
                "{}",
                format!("✓ Cancellation of run {} requested", uuid).green().bold()
            );
            Ok(())
        }
        RunCommands::Status { id } => {
            let uuid = resolve_run_id(client, &id, None).await?;
            let run = client.get_run(uuid).await?;
            print_run_details(&run);
            Ok(())
        }
        RunCommands::List {
            configuration,
            status,
            page,
        } => list_runs(client, configuration, status, page).await,
        RunCommands::Logs { id, follow, from } => {
            let uuid = resolve_run_id(client, &id, None).await?;
            if follow {
                follow_run(client, uuid, from).await
            } else {
                let log = client.download_log(uuid).await?;
                for line in log.lines().skip(from.saturating_sub(1) as usize) {
                    println!("{}", line);
                }
                Ok(())
            }
        }
        RunCommands::Rollback { id, follow } => {
            let uuid = resolve_run_id(client, &id, None).await?;
            let submitted = client.rollback(uuid, Some(&config.operator)).await?;
            println!("{}", "✓ Rollback started".green().bold());
            println!("  Run ID: {}", submitted.run_id.to_string().cyan());
            println!("  Number: #{}", submitted.number);
            if follow {
                follow_run(client, submitted.run_id, 1).await?;
            }
            Ok(())
        }
        RunCommands::Delete { ids } => {
            let mut uuids = Vec::with_capacity(ids.len());
            for id in &ids {
                uuids.push(resolve_run_id(client, id, None).await?);
            }
            if let [uuid] = uuids[..] {
                client.delete_run(uuid).await?;
                println!("{}", format!("✓ Run {} deleted", uuid).green().bold());
                return Ok(());
            }
            let result = client.delete_runs(uuids).await?;
            super::report_batch_delete("Run", &result)
        }
        RunCommands::Artifact {
            id,
            number,
            file,
            output,
        } => {
            let target = match number {
                Some(number) => {
                    ArtifactRef::Numbered(resolve_configuration_id(client, &id).await?, number)
                }
                None => ArtifactRef::Run(resolve_run_id(client, &id, None).await?),
            };
            artifact(client, target, file, output).await
        }
    }
}

async fn start_run(
    client: &OrchestratorClient,
    config: &Config,
    configuration: &str,
    branch: Option<String>,
    follow: bool,
) -> Result<()> {
    let configuration_id = resolve_configuration_id(client, configuration).await?;

    let submitted = match client
        .submit_run(configuration_id, Some(&config.operator), branch)
        .await
    {
        Ok(submitted) => submitted,
        Err(e) if e.is_already_running() => {
            bail!("{}\nUse `kiln run list --configuration {}` to find it", e, configuration);
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", "✓ Run started".green().bold());
    println!("  Run ID: {}", submitted.run_id.to_string().cyan());
    println!("  Number: #{}", submitted.number);

    if follow {
        follow_run(client, submitted.run_id, 1).await?;
    }
    Ok(())
}

async fn list_runs(
    client: &OrchestratorClient,
    configuration: Option<String>,
    status: Option<RunStatus>,
    page: u32,
) -> Result<()> {
    let configuration_id = match configuration {
        Some(input) => Some(resolve_configuration_id(client, &input).await?),
        None => None,
    };

    let query = RunQuery {
        configuration_id,
        status,
        page: Some(page),
        ..Default::default()
    };
    let result = client.list_runs(&query).await?;

    if result.items.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", result.total).bold());
    println!();
    for run in &result.items {
        print_run_summary(run);
    }
    if result.has_more() {
        println!("{}", format!("More on page {}", result.page + 1).dimmed());
    }
    Ok(())
}

/// Stream a run's log until it completes, then report the outcome
async fn follow_run(client: &OrchestratorClient, run_id: Uuid, from: u64) -> Result<()> {
    println!("{}", "─".repeat(80).dimmed());

    let mut next = from.max(1);
    loop {
        let tail = client.tail_log(run_id, next, None).await?;
        for line in &tail.lines {
            println!("{}", line);
        }
        next = tail.next_line;

        if tail.complete {
            break;
        }
        if tail.lines.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    println!("{}", "─".repeat(80).dimmed());

    let run = client.get_run(run_id).await?;
    println!("Run #{} {}", run.number, colorize_status(run.status));
    match run.status {
        RunStatus::Failed => {
            let reason = run
                .failure
                .map(|f| f.message)
                .unwrap_or_else(|| "no reason recorded".to_string());
            bail!("Run {} failed: {}", run_id, reason)
        }
        RunStatus::Cancelled => bail!("Run {} was cancelled", run_id),
        _ => Ok(()),
    }
}

/// Run whose artifact is wanted
#[derive(Debug, Clone, Copy)]
enum ArtifactRef {
    Run(Uuid),
    /// Configuration and run number
    Numbered(Uuid, i64),
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactRef::Run(id) => write!(f, "run {}", id),
            ArtifactRef::Numbered(configuration_id, number) => {
                write!(f, "run #{} of {}", number, configuration_id)
            }
        }
    }
}

async fn artifact(
    client: &OrchestratorClient,
    target: ArtifactRef,
    file: Option<String>,
    output: Option<String>,
) -> Result<()> {
    let manifest = match target {
        ArtifactRef::Run(id) => client.get_artifact(id).await?,
        ArtifactRef::Numbered(configuration_id, number) => {
            client.get_artifact_by_number(configuration_id, number).await?
        }
    };

    let Some(file) = file else {
        println!(
            "{}",
            format!(
                "Artifact of {} ({} file(s), {} bytes):",
                target,
                manifest.files.len(),
                manifest.size_bytes
            )
            .bold()
        );
        for path in &manifest.files {
            println!("  {} {}", "▸".cyan(), path);
        }
        return Ok(());
    };

    let bytes = match target {
        ArtifactRef::Run(id) => client.download_artifact_file(id, &file).await?,
        ArtifactRef::Numbered(configuration_id, number) => {
            client
                .download_artifact_file_by_number(configuration_id, number, &file)
                .await?
        }
    };
    let target = output.unwrap_or_else(|| {
        file.rsplit('/').next().unwrap_or(file.as_str()).to_string()
    });
    std::fs::write(&target, &bytes).with_context(|| format!("Failed to write {}", target))?;

    println!(
        "{}",
        format!("✓ Saved {} ({} bytes)", target, bytes.len()).green().bold()
    );
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_run_summary(run: &Run) {
    let kind = match run.kind {
        RunKind::Build => "build".to_string(),
        RunKind::Rollback { source_run } => format!("rollback of {}", source_run),
    };

    println!(
        "  {} #{} {} {}",
        "▸".cyan(),
        run.number,
        run.snapshot.name.bold(),
        colorize_status(run.status)
    );
    println!("    ID:        {}", run.id.to_string().dimmed());
    println!("    Kind:      {}", kind.dimmed());
    println!(
        "    Trigger:   {} ({})",
        run.trigger.source,
        run.trigger.identity.dimmed()
    );
    println!(
        "    Requested: {}",
        run.requested_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:            {}", run.id.to_string().cyan());
    println!("  Configuration: {} ({})", run.snapshot.name.bold(), run.configuration_id.to_string().dimmed());
    println!("  Number:        #{}", run.number);
    println!("  Status:        {}", colorize_status(run.status));
    if let RunKind::Rollback { source_run } = run.kind {
        println!("  Rollback of:   {}", source_run);
    }
    println!(
        "  Trigger:       {} ({})",
        run.trigger.source, run.trigger.identity
    );
    println!(
        "  Requested:     {}",
        run.requested_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(started) = run.started_at {
        println!("  Started:       {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = run.completed_at {
        println!("  Completed:     {}", completed.format("%Y-%m-%d %H:%M:%S"));
        if let Some(started) = run.started_at {
            let seconds = completed.signed_duration_since(started).num_seconds();
            println!("  Duration:      {}s", seconds);
        }
    }
    if let Some(code) = run.exit_code {
        println!("  Exit Code:     {}", code);
    }

    if let Some(artifact) = &run.artifact {
        println!("\n{}", "Artifact:".bold());
        println!("  Files: {}", artifact.files.len());
        println!("  Size:  {} bytes", artifact.size_bytes);
    }

    if let Some(release) = &run.release {
        println!("\n{}", "Release:".bold());
        println!(
            "  {} {}",
            release.method,
            if release.success { "✓".green() } else { "✗".red() }
        );
        if let Some(message) = &release.message {
            println!("  {}", message.dimmed());
        }
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        if let Some(stage) = failure.stage {
            println!("  Stage: {}", stage);
        }
        println!("  {}", failure.message.red());
    }
}

/// Colorize run status for display
fn colorize_status(status: RunStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        RunStatus::Queued => label.yellow(),
        RunStatus::Fetching
        | RunStatus::Building
        | RunStatus::Packaging
        | RunStatus::Releasing => label.cyan(),
        RunStatus::Cancelling => label.magenta(),
        RunStatus::Succeeded => label.green(),
        RunStatus::PartialSuccess => label.yellow().bold(),
        RunStatus::Failed => label.red(),
        RunStatus::Cancelled => label.dimmed(),
    }
}
