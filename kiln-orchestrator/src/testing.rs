//! Engine fixtures shared by the unit tests and the integration scenarios
//!
//! Built only for tests or with the `testing` feature.

use async_trait::async_trait;
use kiln_core::domain::configuration::{
    BuildConfiguration, SourceRef, StageTimeouts, TriggerPolicy,
};
use kiln_core::domain::release::ReleaseMethod;
use kiln_core::domain::run::{Artifact, Run, RunKind, RunStatus};
use kiln_core::domain::trigger::{Trigger, TriggerSource};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::db::testing::pool_in;
use crate::repository::configuration_repository;
use crate::service::controller::RunServices;
use crate::service::engine::Engine;
use crate::service::history::HistoryStore;
use crate::service::log_sink::LogSink;
use crate::service::release::{ReleaseError, ReleaseExecutor, ReleaseRequest, ReleaseTransport};
use crate::service::source::{FetchError, SourceFetcher};
use crate::storage::DataLayout;

pub fn build_configuration(name: &str) -> BuildConfiguration {
    let now = chrono::Utc::now();
    BuildConfiguration {
        id: Uuid::new_v4(),
        name: name.to_string(),
        group: None,
        source: SourceRef {
            repository: "fake://repo".to_string(),
            branch: Some("main".to_string()),
            tag: None,
        },
        script: "echo building; echo payload > app.bin".to_string(),
        result_path: "app.bin".to_string(),
        release: ReleaseMethod::None,
        retention_days: None,
        triggers: TriggerPolicy::default(),
        env_vars: HashMap::new(),
        timeouts: StageTimeouts::default(),
        created_at: now,
        updated_at: now,
    }
}

/// A terminal run; successful ones carry an artifact
pub fn finished_run(
    config: &BuildConfiguration,
    number: i64,
    status: RunStatus,
    completed_at: chrono::DateTime<chrono::Utc>,
) -> Run {
    let id = Uuid::new_v4();
    let artifact = matches!(status, RunStatus::Succeeded | RunStatus::PartialSuccess).then(|| {
        Artifact {
            location: format!("/tmp/kiln-test/artifacts/{}", id),
            files: vec!["app.bin".to_string()],
            size_bytes: 8,
        }
    });

    Run {
        id,
        configuration_id: config.id,
        number,
        kind: RunKind::Build,
        snapshot: config.clone(),
        status,
        trigger: Trigger::new(TriggerSource::Manual, "tester"),
        requested_at: completed_at - chrono::Duration::minutes(1),
        started_at: Some(completed_at - chrono::Duration::minutes(1)),
        completed_at: Some(completed_at),
        exit_code: Some(0),
        artifact,
        release: None,
        failure: None,
    }
}

/// Writes nothing and succeeds, after failing transiently `transient_failures` times
#[derive(Default)]
pub struct FakeFetcher {
    pub transient_failures: u32,
    pub fatal: bool,
    pub calls: AtomicU32,
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, source: &SourceRef, workspace: &Path) -> Result<Vec<String>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fatal {
            return Err(FetchError::Fatal(format!("{} does not exist", source.repository)));
        }
        if call <= self.transient_failures {
            return Err(FetchError::Transient("connection reset".to_string()));
        }
        tokio::fs::write(workspace.join("README"), b"fixture")
            .await
            .map_err(|e| FetchError::Fatal(e.to_string()))?;
        Ok(vec![format!("fetched {}", source.repository)])
    }
}

/// Succeeds unless `fail` is set
#[derive(Default)]
pub struct FakeTransport {
    pub fail: bool,
}

#[async_trait]
impl ReleaseTransport for FakeTransport {
    async fn deliver(&self, request: &ReleaseRequest<'_>) -> Result<Vec<String>, ReleaseError> {
        if self.fail {
            return Err(ReleaseError::CommandFailed {
                command: "scp".to_string(),
                code: 1,
                output: "host unreachable".to_string(),
            });
        }
        Ok(vec![format!("delivered {} file(s)", request.files.len())])
    }
}

pub fn fast_config(dir: &Path) -> Config {
    let mut config = Config::new(dir.to_path_buf());
    config.cancel_grace = Duration::from_secs(2);
    config.log_flush_timeout = Duration::from_secs(5);
    config
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub history: HistoryStore,
    pub logs: Arc<LogSink>,
    pub fetcher: Arc<FakeFetcher>,
}

impl TestEngine {
    pub async fn new(dir: &Path) -> Self {
        Self::with(dir, FakeFetcher::default(), FakeTransport::default()).await
    }

    pub async fn with(dir: &Path, fetcher: FakeFetcher, transport: FakeTransport) -> Self {
        let pool = pool_in(dir).await;
        let layout = DataLayout::new(dir);
        layout.ensure().await.unwrap();

        let history = HistoryStore::new(pool, layout.clone());
        let logs = Arc::new(LogSink::new(layout));
        let fetcher = Arc::new(fetcher);
        let services = RunServices {
            config: fast_config(dir),
            history: history.clone(),
            logs: logs.clone(),
            fetcher: fetcher.clone(),
            releaser: ReleaseExecutor::new(Arc::new(transport)),
        };

        Self {
            engine: Engine::new(services),
            history,
            logs,
            fetcher,
        }
    }

    /// Inserts the configuration, or replaces the stored one with the same id
    pub async fn store(&self, config: &BuildConfiguration) {
        let pool = self.history.pool();
        if !configuration_repository::update(pool, config).await.unwrap() {
            configuration_repository::create(pool, config).await.unwrap();
        }
    }
}
