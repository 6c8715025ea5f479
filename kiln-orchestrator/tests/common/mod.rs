//! Scenario helpers on top of the crate's engine fixtures

use kiln_core::domain::configuration::BuildConfiguration;
use kiln_core::domain::run::{Run, RunStatus};
use kiln_core::domain::trigger::{Trigger, TriggerSource};
use kiln_orchestrator::testing::{TestEngine, build_configuration};
use std::ops::Deref;
use std::time::Duration;
use uuid::Uuid;

/// A [`TestEngine`] in its own data directory
pub struct Harness {
    fixture: TestEngine,
    _dir: tempfile::TempDir,
}

impl Deref for Harness {
    type Target = TestEngine;

    fn deref(&self) -> &TestEngine {
        &self.fixture
    }
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = TestEngine::new(dir.path()).await;
        Self { fixture, _dir: dir }
    }

    /// Stores a configuration running `script` and packaging `result_path`
    pub async fn configuration(&self, name: &str, script: &str, result_path: &str) -> BuildConfiguration {
        let mut config = build_configuration(name);
        config.script = script.to_string();
        config.result_path = result_path.to_string();
        self.store(&config).await;
        config
    }

    pub async fn submit(&self, configuration_id: Uuid) -> Run {
        self.engine
            .submit(configuration_id, operator(), None)
            .await
            .expect("submit")
    }

    /// Polls until the run reaches `status`
    pub async fn wait_for(&self, run_id: Uuid, status: RunStatus) -> Run {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                let run = self.engine.status(run_id).await.expect("status");
                if run.status == status {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("run {} never reached {}", run_id, status))
    }

    pub async fn finish(&self, run_id: Uuid) -> Run {
        tokio::time::timeout(Duration::from_secs(30), self.engine.wait(run_id))
            .await
            .expect("run did not finish in time")
            .expect("wait")
    }

    /// Every log line of a finished run
    pub async fn log(&self, run_id: Uuid) -> Vec<String> {
        self.engine
            .tail(run_id, 1, usize::MAX)
            .await
            .expect("tail")
            .lines
    }
}

pub fn operator() -> Trigger {
    Trigger::new(TriggerSource::Manual, "operator")
}

/// Position of a status along the forward path; terminal states share the last rank
pub fn rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Queued => 0,
        RunStatus::Fetching => 1,
        RunStatus::Building => 2,
        RunStatus::Packaging => 3,
        RunStatus::Releasing => 4,
        RunStatus::Cancelling => 5,
        _ => 6,
    }
}
