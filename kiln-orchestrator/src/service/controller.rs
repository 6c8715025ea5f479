//! Run Controller
//!
//! Drives one run through fetch, build, package and release. The controller
//! is the only writer of its run: every transition is persisted to the
//! history store first and then published on a watch channel that the
//! engine hands to readers.

use kiln_core::domain::run::{
    Artifact, FailureKind, Run, RunFailure, RunKind, RunStatus, Stage,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::service::cancel::CancelSignal;
use crate::service::history::HistoryStore;
use crate::service::log_sink::LogSink;
use crate::service::package::{self, PackageError};
use crate::service::process::ScriptProcess;
use crate::service::release::ReleaseExecutor;
use crate::service::source::{FetchError, SourceFetcher};
use crate::storage::remove_dir_if_exists;

/// Lines of build output kept for the failure message
const FAILURE_TAIL_LINES: usize = 20;
/// Output lines handled per loop iteration before cancellation is rechecked
const OUTPUT_CHUNK: usize = 64;
/// Upper bound for collecting output left in the pipe after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborators shared by every controller
pub struct RunServices {
    pub config: Config,
    pub history: HistoryStore,
    pub logs: Arc<LogSink>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub releaser: ReleaseExecutor,
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("build script exited with code {code}")]
    ProcessFailed { code: i32, tail: Vec<String> },
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    fn into_failure(self, stage: Stage) -> RunFailure {
        let kind = match &self {
            StageError::Fetch(_) => FailureKind::FetchFailed,
            StageError::ProcessFailed { .. } => FailureKind::ProcessFailure,
            StageError::Package(_) => FailureKind::PackageFailed,
            StageError::Io(_) => FailureKind::Internal,
        };
        let mut message = self.to_string();
        if let StageError::ProcessFailed { tail, .. } = &self {
            if !tail.is_empty() {
                message.push('\n');
                message.push_str(&tail.join("\n"));
            }
        }
        RunFailure {
            kind,
            stage: Some(stage),
            message,
        }
    }
}

/// Why a stage sequence stopped early
enum Interrupt {
    Cancelled,
    Failed(RunFailure),
}

type StageResult<T> = Result<T, Interrupt>;

/// Terminal status reached without interruption
struct Completion {
    status: RunStatus,
    failure: Option<RunFailure>,
}

pub struct RunController {
    services: Arc<RunServices>,
    run: Run,
    status: watch::Sender<Run>,
    cancel: CancelSignal,
    /// Whether the history store holds the latest snapshot
    stored: bool,
    /// Artifact being redeployed by a rollback run
    rollback_artifact: Option<Artifact>,
}

impl RunController {
    /// Creates a controller for an admitted (queued, persisted) run
    ///
    /// # Returns
    /// The controller and a receiver that always holds the latest snapshot
    pub fn new(
        services: Arc<RunServices>,
        run: Run,
        cancel: CancelSignal,
    ) -> (Self, watch::Receiver<Run>) {
        let (status, rx) = watch::channel(run.clone());
        let controller = Self {
            services,
            run,
            status,
            cancel,
            stored: true,
            rollback_artifact: None,
        };
        (controller, rx)
    }

    pub fn with_rollback_artifact(mut self, artifact: Artifact) -> Self {
        self.rollback_artifact = Some(artifact);
        self
    }

    /// Runs every stage to a terminal status and returns the final snapshot
    pub async fn execute(mut self) -> Run {
        tracing::info!(
            "Run {} (#{} of {}) started",
            self.run.id,
            self.run.number,
            self.run.configuration_id
        );

        let result = match self.run.kind {
            RunKind::Build => self.build_sequence().await,
            RunKind::Rollback { source_run } => self.rollback_sequence(source_run).await,
        };

        match result {
            Ok(completion) => self.complete(completion).await,
            Err(Interrupt::Failed(failure)) => {
                self.complete(Completion {
                    status: RunStatus::Failed,
                    failure: Some(failure),
                })
                .await
            }
            Err(Interrupt::Cancelled) => self.cancelled().await,
        }

        self.cleanup().await;
        if !self.stored {
            self.persist_until_stored().await;
        }
        self.run
    }

    // =========================================================================
    // Stage sequences
    // =========================================================================

    async fn build_sequence(&mut self) -> StageResult<Completion> {
        let workspace = self.services.history.layout().workspace(self.run.id);

        self.fetch(&workspace).await?;
        self.build(&workspace).await?;
        let artifact = self.package(&workspace).await?;

        if !self.run.snapshot.release.is_enabled() {
            return Ok(Completion {
                status: RunStatus::Succeeded,
                failure: None,
            });
        }

        self.transition(RunStatus::Releasing).await;
        if self.release(&artifact).await? {
            Ok(Completion {
                status: RunStatus::Succeeded,
                failure: None,
            })
        } else {
            let message = self.release_message();
            Ok(Completion {
                status: RunStatus::PartialSuccess,
                failure: Some(RunFailure {
                    kind: FailureKind::ReleaseFailed,
                    stage: Some(Stage::Release),
                    message,
                }),
            })
        }
    }

    async fn rollback_sequence(&mut self, source_run: Uuid) -> StageResult<Completion> {
        let artifact = self.rollback_artifact.clone().ok_or_else(|| {
            Interrupt::Failed(RunFailure {
                kind: FailureKind::Internal,
                stage: Some(Stage::Release),
                message: format!("artifact of run {} is not available", source_run),
            })
        })?;

        self.log(format!(
            "[kiln] Redeploying artifact of run {} ({} file(s))",
            source_run,
            artifact.files.len()
        ));
        self.transition(RunStatus::Releasing).await;

        if self.release(&artifact).await? {
            Ok(Completion {
                status: RunStatus::Succeeded,
                failure: None,
            })
        } else {
            // Nothing new was packaged, so a failed redeploy is a plain failure
            Err(Interrupt::Failed(RunFailure {
                kind: FailureKind::ReleaseFailed,
                stage: Some(Stage::Release),
                message: self.release_message(),
            }))
        }
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn fetch(&mut self, workspace: &Path) -> StageResult<()> {
        self.transition(RunStatus::Fetching).await;

        let source = self.run.snapshot.source.clone();
        self.log(format!(
            "[kiln] Fetching {} ({})",
            source.repository,
            source.revision().unwrap_or("default branch")
        ));

        let fut = fetch_with_retry(
            self.services.fetcher.clone(),
            self.services.logs.clone(),
            self.run.id,
            source,
            workspace.to_path_buf(),
            self.services.config.fetch_retries,
        );
        self.guarded(Stage::Fetch, fut).await
    }

    async fn build(&mut self, workspace: &Path) -> StageResult<()> {
        self.transition(RunStatus::Building).await;

        let budget = self.stage_budget(Stage::Build);
        let deadline = Instant::now() + budget;
        let grace = self.services.config.cancel_grace;
        let cancel = self.cancel.clone();

        let (mut process, mut output) = ScriptProcess::spawn(
            &self.services.config.shell,
            &self.run.snapshot.script,
            workspace,
            &self.build_env(),
        )
        .map_err(|e| {
            Interrupt::Failed(RunFailure {
                kind: FailureKind::Internal,
                stage: Some(Stage::Build),
                message: format!("failed to start build script: {}", e),
            })
        })?;

        let mut tail = VecDeque::with_capacity(FAILURE_TAIL_LINES);
        let mut chunk = Vec::with_capacity(OUTPUT_CHUNK);
        let mut output_open = true;

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.requested() => {
                    self.enter_cancelling().await;
                    self.log("[kiln] Cancellation requested, stopping build script");
                    process.terminate(grace).await;
                    self.drain_output(&mut output, &mut tail).await;
                    return Err(Interrupt::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.log(format!("[kiln] Build exceeded its budget of {:?}, stopping", budget));
                    process.terminate(grace).await;
                    self.drain_output(&mut output, &mut tail).await;
                    return Err(Interrupt::Failed(timeout_failure(Stage::Build, budget)));
                }
                received = output.recv_many(&mut chunk, OUTPUT_CHUNK), if output_open => {
                    if received == 0 {
                        output_open = false;
                    } else {
                        self.append_output(&mut chunk, &mut tail);
                    }
                }
                status = process.wait() => break status,
            }
        };

        self.drain_output(&mut output, &mut tail).await;

        let status = exit.map_err(|e| {
            Interrupt::Failed(RunFailure {
                kind: FailureKind::Internal,
                stage: Some(Stage::Build),
                message: format!("failed to wait for build script: {}", e),
            })
        })?;

        // Killed by a signal counts as a failure too
        let code = status.code().unwrap_or(-1);
        self.run.exit_code = Some(code);
        self.log(format!("[kiln] Build script exited with code {}", code));

        if code != 0 {
            let error = StageError::ProcessFailed {
                code,
                tail: tail.into_iter().collect(),
            };
            return Err(Interrupt::Failed(error.into_failure(Stage::Build)));
        }
        Ok(())
    }

    async fn package(&mut self, workspace: &Path) -> StageResult<Artifact> {
        self.transition(RunStatus::Packaging).await;

        let budget = self.stage_budget(Stage::Package);
        let dest = self.services.history.layout().artifact_dir(self.run.id);
        let result_path = self.run.snapshot.result_path.clone();
        self.log(format!("[kiln] Packaging '{}'", result_path));

        let mut task = {
            let workspace = workspace.to_path_buf();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || package::package(&workspace, &result_path, &dest))
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.requested() => Err(Interrupt::Cancelled),
            joined = tokio::time::timeout(budget, &mut task) => match joined {
                Err(_) => Err(Interrupt::Failed(timeout_failure(Stage::Package, budget))),
                Ok(Err(e)) => Err(Interrupt::Failed(RunFailure {
                    kind: FailureKind::Internal,
                    stage: Some(Stage::Package),
                    message: format!("packaging task failed: {}", e),
                })),
                Ok(Ok(Err(e))) => Err(Interrupt::Failed(StageError::from(e).into_failure(Stage::Package))),
                Ok(Ok(Ok(artifact))) => Ok(artifact),
            },
        };

        match outcome {
            Ok(artifact) => {
                self.log(format!(
                    "[kiln] Packaged {} file(s), {} bytes",
                    artifact.files.len(),
                    artifact.size_bytes
                ));
                self.run.artifact = Some(artifact.clone());
                Ok(artifact)
            }
            Err(interrupt) => {
                // The copy cannot be aborted; discard whatever it leaves behind
                tokio::spawn(async move {
                    let _ = task.await;
                    if let Err(e) = remove_dir_if_exists(&dest).await {
                        tracing::warn!("Failed to remove partial artifact {}: {}", dest.display(), e);
                    }
                });
                Err(interrupt)
            }
        }
    }

    /// Returns whether the release succeeded
    async fn release(&mut self, artifact: &Artifact) -> StageResult<bool> {
        let method = self.run.snapshot.release.clone();
        self.log(format!("[kiln] Releasing via {}", method.kind()));

        let services = self.services.clone();
        let run_id = self.run.id;
        let report = self
            .guarded(Stage::Release, async move {
                Ok::<_, StageError>(services.releaser.release(run_id, artifact, &method).await)
            })
            .await?;

        self.log_all(report.output);
        let success = report.outcome.success;
        self.run.release = Some(report.outcome);
        Ok(success)
    }

    // =========================================================================
    // Terminal handling
    // =========================================================================

    async fn complete(&mut self, completion: Completion) {
        // A cancel request observed before this point wins the race
        if !self.cancel.commit() {
            self.cancelled().await;
            return;
        }

        // The output tail is already in the log
        if let Some(headline) = completion
            .failure
            .as_ref()
            .and_then(|failure| failure.message.lines().next())
        {
            self.log(format!("[kiln] {}", headline));
        }
        self.log(format!("[kiln] Run finished: {}", completion.status));
        self.run.failure = completion.failure;
        self.finalize(completion.status).await;
    }

    async fn cancelled(&mut self) {
        self.enter_cancelling().await;

        if self.run.artifact.is_none() {
            let dir = self.services.history.layout().artifact_dir(self.run.id);
            if let Err(e) = remove_dir_if_exists(&dir).await {
                tracing::warn!("Failed to remove artifact of cancelled run {}: {}", self.run.id, e);
            }
        }

        self.log("[kiln] Run cancelled");
        self.finalize(RunStatus::Cancelled).await;
        self.cancel.seal();
    }

    async fn enter_cancelling(&mut self) {
        if self.run.status != RunStatus::Cancelling {
            self.transition(RunStatus::Cancelling).await;
        }
    }

    async fn finalize(&mut self, status: RunStatus) {
        // No more output; readers report completion once they catch up
        self.services.logs.close(self.run.id);
        self.transition(status).await;

        tracing::info!(
            "Run {} (#{} of {}) finished with status {}",
            self.run.id,
            self.run.number,
            self.run.configuration_id,
            status
        );
    }

    async fn cleanup(&self) {
        let flush_timeout = self.services.config.log_flush_timeout;
        if let Err(e) = self.services.logs.finish(self.run.id, flush_timeout).await {
            tracing::error!("Failed to flush log of run {}: {}", self.run.id, e);
        }

        let workspace = self.services.history.layout().workspace(self.run.id);
        if let Err(e) = remove_dir_if_exists(&workspace).await {
            tracing::warn!("Failed to remove workspace {}: {}", workspace.display(), e);
        }
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    /// Applies a transition if the state graph allows it, persists and publishes it
    async fn transition(&mut self, next: RunStatus) -> bool {
        if !self.run.status.can_transition_to(next) {
            tracing::error!(
                "Run {}: refusing transition {} -> {}",
                self.run.id,
                self.run.status,
                next
            );
            return false;
        }

        let now = chrono::Utc::now();
        if self.run.started_at.is_none()
            && matches!(next, RunStatus::Fetching | RunStatus::Releasing)
        {
            self.run.started_at = Some(now);
        }
        if next.is_terminal() {
            self.run.completed_at = Some(now);
        }

        tracing::debug!("Run {}: {} -> {}", self.run.id, self.run.status, next);
        self.run.status = next;
        self.stored = self.persist().await;
        self.status.send_replace(self.run.clone());
        true
    }

    /// Writes the run to the history store, retrying with exponential backoff
    ///
    /// Returns false once the attempts are used up.
    async fn persist(&self) -> bool {
        const MAX_ATTEMPTS: u32 = 5;
        const INITIAL_DELAY_MS: u64 = 100;
        const MAX_DELAY_MS: u64 = 2_000;

        let mut attempt = 0;
        let mut delay_ms = INITIAL_DELAY_MS;

        loop {
            attempt += 1;
            match self.services.history.update(&self.run).await {
                Ok(()) => return true,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        "Persisting run {} failed (attempt {}/{}): {}. Retrying in {}ms",
                        self.run.id,
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up persisting run {} as {}: {}",
                        self.run.id,
                        self.run.status,
                        e
                    );
                    return false;
                }
            }
        }
    }

    /// Keeps writing the terminal snapshot until the history store takes it
    ///
    /// The engine keeps the run's live entry until this returns, so admission
    /// sees the terminal status instead of the stale row.
    async fn persist_until_stored(&mut self) {
        const INITIAL_DELAY_MS: u64 = 500;
        const MAX_DELAY_MS: u64 = 30_000;

        let mut delay_ms = INITIAL_DELAY_MS;
        loop {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match self.services.history.update(&self.run).await {
                Ok(()) => {
                    tracing::info!("Run {} stored as {}", self.run.id, self.run.status);
                    self.stored = true;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Run {} still not stored as {}: {}. Retrying in {}ms",
                        self.run.id,
                        self.run.status,
                        e,
                        delay_ms
                    );
                    delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
                }
            }
        }
    }

    /// Runs a stage future under its budget, abandoning it on cancellation
    async fn guarded<T, F>(&self, stage: Stage, fut: F) -> StageResult<T>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let budget = self.stage_budget(stage);
        tokio::select! {
            biased;
            _ = self.cancel.requested() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout(budget, fut) => match result {
                Err(_) => Err(Interrupt::Failed(timeout_failure(stage, budget))),
                Ok(Err(e)) => Err(Interrupt::Failed(e.into_failure(stage))),
                Ok(Ok(value)) => Ok(value),
            },
        }
    }

    fn stage_budget(&self, stage: Stage) -> Duration {
        self.services
            .config
            .stage_timeout(stage, &self.run.snapshot.timeouts)
    }

    fn build_env(&self) -> HashMap<String, String> {
        let snapshot = &self.run.snapshot;
        let mut env = snapshot.env_vars.clone();
        env.insert("KILN_RUN_ID".to_string(), self.run.id.to_string());
        env.insert("KILN_RUN_NUMBER".to_string(), self.run.number.to_string());
        env.insert(
            "KILN_CONFIGURATION_ID".to_string(),
            self.run.configuration_id.to_string(),
        );
        env.insert(
            "KILN_BRANCH".to_string(),
            snapshot.source.revision().unwrap_or_default().to_string(),
        );
        env
    }

    fn release_message(&self) -> String {
        self.run
            .release
            .as_ref()
            .and_then(|outcome| outcome.message.clone())
            .unwrap_or_else(|| "release failed".to_string())
    }

    fn append_output(&self, chunk: &mut Vec<String>, tail: &mut VecDeque<String>) {
        for line in chunk.iter() {
            if tail.len() == FAILURE_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        self.log_all(chunk.drain(..));
    }

    async fn drain_output(&self, output: &mut mpsc::Receiver<String>, tail: &mut VecDeque<String>) {
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        let mut chunk = Vec::with_capacity(OUTPUT_CHUNK);
        loop {
            match tokio::time::timeout_at(deadline, output.recv_many(&mut chunk, OUTPUT_CHUNK)).await
            {
                Ok(0) | Err(_) => break,
                Ok(_) => self.append_output(&mut chunk, tail),
            }
        }
    }

    fn log(&self, line: impl Into<String>) {
        self.log_all(std::iter::once(line.into()));
    }

    fn log_all<I>(&self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Err(e) = self.services.logs.append(self.run.id, lines) {
            tracing::debug!("Dropping log output of run {}: {}", self.run.id, e);
        }
    }
}

fn timeout_failure(stage: Stage, budget: Duration) -> RunFailure {
    RunFailure {
        kind: FailureKind::StageTimeout,
        stage: Some(stage),
        message: format!("{} stage exceeded its budget of {:?}", stage, budget),
    }
}

/// Fetches into a fresh workspace, retrying transient errors with backoff
async fn fetch_with_retry(
    fetcher: Arc<dyn SourceFetcher>,
    logs: Arc<LogSink>,
    run_id: Uuid,
    source: kiln_core::domain::configuration::SourceRef,
    workspace: PathBuf,
    retries: u32,
) -> Result<(), StageError> {
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 10_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;
        remove_dir_if_exists(&workspace).await?;
        tokio::fs::create_dir_all(&workspace).await?;

        match fetcher.fetch(&source, &workspace).await {
            Ok(lines) => {
                let _ = logs.append(run_id, lines);
                return Ok(());
            }
            Err(FetchError::Transient(message)) if attempt <= retries => {
                let _ = logs.append(
                    run_id,
                    [format!(
                        "[kiln] Fetch attempt {} failed: {}. Retrying in {}ms",
                        attempt, message, delay_ms
                    )],
                );
                tracing::warn!("Run {}: transient fetch error: {}", run_id, message);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_failure_message_carries_tail() {
        let failure = StageError::ProcessFailed {
            code: 2,
            tail: vec!["compiling".to_string(), "error: boom".to_string()],
        }
        .into_failure(Stage::Build);

        assert_eq!(failure.kind, FailureKind::ProcessFailure);
        assert_eq!(failure.stage, Some(Stage::Build));
        assert_eq!(
            failure.message,
            "build script exited with code 2\ncompiling\nerror: boom"
        );
    }

    #[test]
    fn test_stage_error_kinds() {
        let fetch = StageError::Fetch(FetchError::Fatal("no such repo".to_string()))
            .into_failure(Stage::Fetch);
        assert_eq!(fetch.kind, FailureKind::FetchFailed);

        let package = StageError::Package(PackageError::NoMatch("dist".to_string()))
            .into_failure(Stage::Package);
        assert_eq!(package.kind, FailureKind::PackageFailed);
        assert!(package.message.contains("dist"));
    }

    #[test]
    fn test_timeout_failure() {
        let failure = timeout_failure(Stage::Fetch, Duration::from_secs(3));
        assert_eq!(failure.kind, FailureKind::StageTimeout);
        assert!(failure.message.starts_with("fetch stage exceeded"));
    }
}
