//! Orchestration Engine
//!
//! Owns admission: at most one non-terminal run per configuration. The
//! admission decision for a configuration runs under that configuration's
//! own lock, taken from a keyed table that grows lazily and shrinks again
//! once nobody holds or waits for an entry. Unrelated configurations never
//! contend.
//!
//! Every admitted run gets its own controller task. The engine keeps the
//! receiving side of the controller's status channel, so `status` reads the
//! latest published snapshot without ever waiting on the controller.

use kiln_core::domain::log::LogTail;
use kiln_core::domain::run::{FailureKind, Run, RunFailure, RunKind, RunStatus};
use kiln_core::domain::trigger::Trigger;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, watch};
use uuid::Uuid;

use crate::repository::configuration_repository;
use crate::service::cancel::{CancelRequest, CancelSignal};
use crate::service::controller::{RunController, RunServices};
use crate::service::history::HistoryError;
use crate::service::log_sink::LogError;
use crate::storage::remove_dir_if_exists;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration {0} not found")]
    ConfigurationNotFound(Uuid),
    #[error("configuration {0} is disabled")]
    ConfigurationDisabled(Uuid),
    #[error("configuration {configuration_id} already has active run {run_id}")]
    AlreadyRunning { configuration_id: Uuid, run_id: Uuid },
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {0} is already terminal")]
    AlreadyTerminal(Uuid),
    #[error("no artifact is retained for run {0}")]
    ArtifactNotFound(Uuid),
    #[error("configuration {0} has no release method")]
    NoReleaseMethod(Uuid),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

struct ActiveRun {
    configuration_id: Uuid,
    snapshot: watch::Receiver<Run>,
    cancel: CancelSignal,
}

type AdmissionTable = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

pub struct Engine {
    services: Arc<RunServices>,
    admission: AdmissionTable,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
}

/// Exclusive admission section of one configuration
///
/// Released on drop; the table entry is reclaimed if nobody else wants it.
pub struct AdmissionGuard<'a> {
    table: &'a AdmissionTable,
    configuration_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = lock(self.table);
        if let Some(entry) = table.get(&self.configuration_id) {
            // Only the table itself still references the lock
            if Arc::strong_count(entry) == 1 {
                table.remove(&self.configuration_id);
            }
        }
    }
}

impl Engine {
    pub fn new(services: RunServices) -> Arc<Self> {
        Arc::new(Self {
            services: Arc::new(services),
            admission: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn services(&self) -> &RunServices {
        &self.services
    }

    /// Enters the admission section of a configuration
    ///
    /// Configuration edits take the same section so they cannot interleave
    /// with an admission decision.
    pub async fn lock_configuration(&self, configuration_id: Uuid) -> AdmissionGuard<'_> {
        let entry = {
            let mut table = lock(&self.admission);
            table.entry(configuration_id).or_default().clone()
        };
        let guard = entry.lock_owned().await;

        AdmissionGuard {
            table: &self.admission,
            configuration_id,
            guard: Some(guard),
        }
    }

    /// Admits a new build run of a configuration
    ///
    /// # Arguments
    /// * `configuration_id` - Configuration to build
    /// * `trigger` - Source and identity recorded on the run
    /// * `branch` - Optional branch overriding the configured revision
    pub async fn submit(
        self: &Arc<Self>,
        configuration_id: Uuid,
        trigger: Trigger,
        branch: Option<String>,
    ) -> Result<Run> {
        let _admission = self.lock_configuration(configuration_id).await;

        let config = configuration_repository::find_by_id(self.services.history.pool(), configuration_id)
            .await?
            .ok_or(EngineError::ConfigurationNotFound(configuration_id))?;
        if !config.triggers.enabled {
            return Err(EngineError::ConfigurationDisabled(configuration_id));
        }
        self.ensure_idle(configuration_id).await?;

        let mut snapshot = config;
        if let Some(branch) = branch.filter(|b| !b.trim().is_empty()) {
            snapshot.source.branch = Some(branch);
            snapshot.source.tag = None;
        }

        let run = self
            .admit(configuration_id, RunKind::Build, snapshot, trigger)
            .await?;
        self.launch(&run, None);
        Ok(run)
    }

    /// Admits a release-only run that redeploys a historical artifact
    ///
    /// The configuration's current release method is used. Fails with
    /// `ArtifactNotFound` when the run never packaged anything or its artifact
    /// has been pruned.
    pub async fn rollback(self: &Arc<Self>, source_run_id: Uuid, trigger: Trigger) -> Result<Run> {
        let source = self
            .services
            .history
            .find(source_run_id)
            .await?
            .ok_or(EngineError::RunNotFound(source_run_id))?;

        let artifact = source
            .artifact
            .clone()
            .filter(|_| source.is_rollback_eligible())
            .filter(|artifact| Path::new(&artifact.location).is_dir())
            .ok_or(EngineError::ArtifactNotFound(source_run_id))?;

        let configuration_id = source.configuration_id;
        let _admission = self.lock_configuration(configuration_id).await;

        let config = configuration_repository::find_by_id(self.services.history.pool(), configuration_id)
            .await?
            .ok_or(EngineError::ConfigurationNotFound(configuration_id))?;
        if !config.triggers.enabled {
            return Err(EngineError::ConfigurationDisabled(configuration_id));
        }
        if !config.release.is_enabled() {
            return Err(EngineError::NoReleaseMethod(configuration_id));
        }
        self.ensure_idle(configuration_id).await?;

        let kind = RunKind::Rollback {
            source_run: source_run_id,
        };
        let run = self.admit(configuration_id, kind, config, trigger).await?;
        self.launch(&run, Some(artifact));

        tracing::info!(
            "Rollback run {} of configuration {} redeploys run {}",
            run.id,
            configuration_id,
            source_run_id
        );
        Ok(run)
    }

    /// Requests cooperative cancellation of a run
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let answer = lock(&self.active).get(&run_id).map(|active| active.cancel.request());

        match answer {
            Some(CancelRequest::Accepted) => {
                tracing::info!("Cancellation requested for run {}", run_id);
                Ok(())
            }
            Some(CancelRequest::AlreadyTerminal) => Err(EngineError::AlreadyTerminal(run_id)),
            None => {
                let run = self
                    .services
                    .history
                    .find(run_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run_id))?;
                if !run.status.is_terminal() {
                    tracing::warn!("Run {} is {} but has no live controller", run_id, run.status);
                }
                Err(EngineError::AlreadyTerminal(run_id))
            }
        }
    }

    /// Latest snapshot of a run
    pub async fn status(&self, run_id: Uuid) -> Result<Run> {
        if let Some(run) = self.live_snapshot(run_id) {
            return Ok(run);
        }
        self.services
            .history
            .find(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Waits until a run's controller has finished, cleanup included
    pub async fn wait(&self, run_id: Uuid) -> Result<Run> {
        let receiver = lock(&self.active).get(&run_id).map(|a| a.snapshot.clone());
        if let Some(mut receiver) = receiver {
            // The sender is dropped once the controller returns
            while receiver.changed().await.is_ok() {}
            let run = receiver.borrow().clone();
            if run.status.is_terminal() {
                return Ok(run);
            }
        }
        self.services
            .history
            .find(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Reads a batch of a run's console output
    pub async fn tail(&self, run_id: Uuid, from_line: u64, max_lines: usize) -> Result<LogTail> {
        match self.services.logs.read(run_id, from_line, max_lines).await {
            Ok(tail) => Ok(tail),
            Err(LogError::NotFound(_)) => {
                // Runs interrupted by a crash never flushed a log
                let run = self.status(run_id).await?;
                Ok(LogTail {
                    lines: Vec::new(),
                    next_line: from_line.max(1),
                    complete: run.status.is_terminal(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run of a configuration whose controller has not returned yet
    ///
    /// Covers the cleanup after the terminal transition, when the history
    /// store already reports the run as finished.
    pub fn live_run(&self, configuration_id: Uuid) -> Option<Uuid> {
        lock(&self.active)
            .iter()
            .find(|(_, active)| {
                active.configuration_id == configuration_id && active.snapshot.has_changed().is_ok()
            })
            .map(|(id, _)| *id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Number of configurations with a live admission table entry
    pub fn admission_entries(&self) -> usize {
        lock(&self.admission).len()
    }

    /// Fails every run left non-terminal by a previous process
    ///
    /// Must run before the first submission.
    pub async fn recover(&self) -> Result<usize> {
        let stale = self.services.history.non_terminal().await?;
        let layout = self.services.history.layout();

        for mut run in stale.iter().cloned() {
            let previous = run.status;
            run.status = RunStatus::Failed;
            run.completed_at = Some(chrono::Utc::now());
            run.failure = Some(RunFailure {
                kind: FailureKind::Interrupted,
                stage: None,
                message: format!("orchestrator stopped while the run was {}", previous),
            });
            self.services.history.update(&run).await?;

            if let Err(e) = remove_dir_if_exists(&layout.workspace(run.id)).await {
                tracing::warn!("Failed to remove workspace of run {}: {}", run.id, e);
            }
            if run.artifact.is_none() {
                if let Err(e) = remove_dir_if_exists(&layout.artifact_dir(run.id)).await {
                    tracing::warn!("Failed to remove partial artifact of run {}: {}", run.id, e);
                }
            }

            tracing::warn!(
                "Run {} of configuration {} was {} at startup, marked failed",
                run.id,
                run.configuration_id,
                previous
            );
        }

        Ok(stale.len())
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    /// Rejects admission while the configuration has a non-terminal run
    async fn ensure_idle(&self, configuration_id: Uuid) -> Result<()> {
        let live = lock(&self.active)
            .iter()
            .find(|(_, active)| {
                active.configuration_id == configuration_id
                    && !active.snapshot.borrow().status.is_terminal()
            })
            .map(|(id, _)| *id);
        if let Some(run_id) = live {
            return Err(EngineError::AlreadyRunning {
                configuration_id,
                run_id,
            });
        }

        if let Some(run) = self.services.history.active_for(configuration_id).await? {
            // A finished run whose terminal write is still being retried
            let settled = self
                .live_snapshot(run.id)
                .is_some_and(|live| live.status.is_terminal());
            if !settled {
                return Err(EngineError::AlreadyRunning {
                    configuration_id,
                    run_id: run.id,
                });
            }
        }
        Ok(())
    }

    /// Persists a queued run; caller holds the admission section
    async fn admit(
        &self,
        configuration_id: Uuid,
        kind: RunKind,
        snapshot: kiln_core::domain::configuration::BuildConfiguration,
        trigger: Trigger,
    ) -> Result<Run> {
        let number = self.services.history.next_number(configuration_id).await?;
        let run = Run {
            id: Uuid::new_v4(),
            configuration_id,
            number,
            kind,
            snapshot,
            status: RunStatus::Queued,
            trigger,
            requested_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            artifact: None,
            release: None,
            failure: None,
        };
        self.services.history.insert(&run).await?;

        tracing::info!(
            "Admitted run {} (#{}) of configuration {} from {} trigger",
            run.id,
            run.number,
            configuration_id,
            run.trigger.source
        );
        Ok(run)
    }

    /// Spawns the controller task of an admitted run
    fn launch(self: &Arc<Self>, run: &Run, rollback_artifact: Option<kiln_core::domain::run::Artifact>) {
        let cancel = CancelSignal::new();
        self.services.logs.open(run.id);

        let (controller, snapshot) =
            RunController::new(self.services.clone(), run.clone(), cancel.clone());
        let controller = match rollback_artifact {
            Some(artifact) => controller.with_rollback_artifact(artifact),
            None => controller,
        };

        lock(&self.active).insert(
            run.id,
            ActiveRun {
                configuration_id: run.configuration_id,
                snapshot,
                cancel,
            },
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let finished = controller.execute().await;
            lock(&engine.active).remove(&finished.id);
        });
    }

    fn live_snapshot(&self, run_id: Uuid) -> Option<Run> {
        lock(&self.active)
            .get(&run_id)
            .map(|active| active.snapshot.borrow().clone())
    }
}

/// Locks a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
