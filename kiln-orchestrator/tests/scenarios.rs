//! End-to-end behaviour of the orchestration engine against real build
//! scripts, a real SQLite history and a temporary data directory.

mod common;

use common::{Harness, operator, rank};
use kiln_core::domain::release::ReleaseMethod;
use kiln_core::domain::run::{FailureKind, RunKind, RunStatus};
use kiln_core::domain::trigger::{Trigger, TriggerSource};
use kiln_orchestrator::service::EngineError;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn concurrent_submissions_admit_one_run_per_configuration() {
    let h = Harness::new().await;
    let mut configs = Vec::new();
    for i in 0..4 {
        let config = h
            .configuration(&format!("app-{}", i), "sleep 1; echo done > out.txt", "out.txt")
            .await;
        configs.push(config.id);
    }

    let mut tasks = Vec::new();
    for &configuration_id in &configs {
        for _ in 0..8 {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                (configuration_id, engine.submit(configuration_id, operator(), None).await)
            }));
        }
    }

    let mut accepted: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for task in tasks {
        let (configuration_id, result) = task.await.unwrap();
        match result {
            Ok(run) => accepted.entry(configuration_id).or_default().push(run.id),
            Err(EngineError::AlreadyRunning { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    for configuration_id in &configs {
        let runs = &accepted[configuration_id];
        assert_eq!(runs.len(), 1, "configuration {} admitted {:?}", configuration_id, runs);

        let active = h.history.active_for(*configuration_id).await.unwrap();
        assert!(active.is_none() || active.map(|r| r.id) == Some(runs[0]));
    }

    for runs in accepted.values() {
        let done = h.finish(runs[0]).await;
        assert_eq!(done.status, RunStatus::Succeeded);
    }
    assert_eq!(h.engine.admission_entries(), 0);
}

#[tokio::test]
async fn status_only_moves_forward() {
    let h = Harness::new().await;
    let dest = tempfile::tempdir().unwrap();
    let mut config = h
        .configuration("web", "for i in 1 2 3; do echo $i; sleep 0.1; done; echo ok > app.bin", "app.bin")
        .await;
    config.release = ReleaseMethod::LocalCopy {
        destination: dest.path().display().to_string(),
        clear_destination: false,
    };
    h.store(&config).await;

    let run = h.submit(config.id).await;
    let mut observed = vec![run.status];
    loop {
        let snapshot = h.engine.status(run.id).await.unwrap();
        if observed.last() != Some(&snapshot.status) {
            observed.push(snapshot.status);
        }
        if snapshot.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for pair in observed.windows(2) {
        assert!(rank(pair[0]) < rank(pair[1]), "regression in {:?}", observed);
    }
    assert_eq!(observed.last(), Some(&RunStatus::Succeeded));
    assert!(observed.contains(&RunStatus::Building));
}

#[tokio::test]
async fn polling_reader_sees_every_line_once_in_order() {
    let h = Harness::new().await;
    let config = h
        .configuration(
            "chatty",
            "i=1; while [ $i -le 300 ]; do echo line $i; if [ $((i % 50)) -eq 0 ]; then sleep 0.05; fi; i=$((i+1)); done; echo x > out.bin",
            "out.bin",
        )
        .await;
    let run = h.submit(config.id).await;

    let mut polled = Vec::new();
    let mut next = 1;
    let tail = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let tail = h.engine.tail(run.id, next, 7).await.unwrap();
            assert_eq!(tail.next_line, next + tail.lines.len() as u64);
            next = tail.next_line;
            polled.extend(tail.lines.iter().cloned());
            if tail.complete {
                return tail;
            }
            if tail.lines.is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    })
    .await
    .expect("log never completed");

    assert!(tail.complete);
    let done = h.finish(run.id).await;
    assert_eq!(done.status, RunStatus::Succeeded);

    let build_lines: Vec<&String> = polled.iter().filter(|l| l.starts_with("line ")).collect();
    let expected: Vec<String> = (1..=300).map(|i| format!("line {}", i)).collect();
    assert_eq!(build_lines.len(), expected.len());
    for (got, want) in build_lines.iter().zip(&expected) {
        assert_eq!(*got, want);
    }

    // A reader arriving after the run drains the flushed copy at once
    let late = h.engine.tail(run.id, 1, usize::MAX).await.unwrap();
    assert_eq!(late.lines, polled);
    assert_eq!(late.next_line, polled.len() as u64 + 1);
    assert!(late.complete);
}

#[tokio::test]
async fn second_submission_while_building_is_rejected() {
    let h = Harness::new().await;
    let config = h
        .configuration("api", "echo compiling; sleep 1; echo bin > api.bin", "api.bin")
        .await;

    let first = h.submit(config.id).await;
    h.wait_for(first.id, RunStatus::Building).await;

    match h.engine.submit(config.id, operator(), None).await {
        Err(EngineError::AlreadyRunning { run_id, configuration_id }) => {
            assert_eq!(run_id, first.id);
            assert_eq!(configuration_id, config.id);
        }
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|r| r.id)),
    }

    let done = h.finish(first.id).await;
    assert_eq!(done.status, RunStatus::Succeeded);
    assert!(done.artifact.is_some());
}

#[tokio::test]
async fn cancel_during_build_tears_down_without_artifact() {
    let h = Harness::new().await;
    // Ignoring TERM forces the grace period and the hard kill
    let config = h
        .configuration("stubborn", "trap '' TERM; echo started; sleep 30; echo x > out.bin", "out.bin")
        .await;

    let run = h.submit(config.id).await;
    h.wait_for(run.id, RunStatus::Building).await;

    let requested = tokio::time::Instant::now();
    h.engine.cancel(run.id).await.unwrap();
    h.wait_for(run.id, RunStatus::Cancelling).await;

    let done = h.finish(run.id).await;
    assert_eq!(done.status, RunStatus::Cancelled);
    assert!(requested.elapsed() < Duration::from_secs(10));
    assert!(done.artifact.is_none());
    assert!(!h.history.layout().artifact_dir(run.id).exists());
    assert!(h.log(run.id).await.iter().any(|l| l == "started"));

    assert!(matches!(
        h.engine.cancel(run.id).await,
        Err(EngineError::AlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn failing_script_fails_the_run_without_artifact() {
    let h = Harness::new().await;
    let config = h
        .configuration("broken", "echo step one; echo oops >&2; echo partial > out.bin; exit 1", "out.bin")
        .await;

    let run = h.submit(config.id).await;
    let done = h.finish(run.id).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.exit_code, Some(1));
    let failure = done.failure.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::ProcessFailure);
    assert!(failure.message.contains("oops"));
    assert!(done.artifact.is_none());
    assert!(!h.history.layout().artifact_dir(run.id).exists());

    let log = h.log(run.id).await;
    assert!(log.iter().any(|l| l == "step one"));
    assert!(log.iter().any(|l| l == "oops"));

    let rollback = h
        .engine
        .rollback(run.id, Trigger::new(TriggerSource::Rollback, "operator"))
        .await;
    assert!(matches!(rollback, Err(EngineError::ArtifactNotFound(_))));
}

#[tokio::test]
async fn rollback_redeploys_until_the_artifact_is_pruned() {
    let h = Harness::new().await;
    let dest = tempfile::tempdir().unwrap();
    let mut config = h
        .configuration("site", "mkdir -p dist && echo v1 > dist/index.html", "dist")
        .await;
    config.release = ReleaseMethod::LocalCopy {
        destination: dest.path().display().to_string(),
        clear_destination: true,
    };
    h.store(&config).await;

    let build = h.finish(h.submit(config.id).await.id).await;
    assert_eq!(build.status, RunStatus::Succeeded);
    // A directory result is packaged by its contents
    let index = dest.path().join("index.html");
    assert!(index.is_file());
    std::fs::write(&index, "tampered").unwrap();

    let trigger = Trigger::new(TriggerSource::Rollback, "operator");
    let rollback = h.engine.rollback(build.id, trigger.clone()).await.unwrap();
    assert_eq!(rollback.kind, RunKind::Rollback { source_run: build.id });
    assert_eq!(rollback.number, 2);

    let redeployed = h.finish(rollback.id).await;
    assert_eq!(redeployed.status, RunStatus::Succeeded);
    assert!(redeployed.artifact.is_none());
    assert_eq!(std::fs::read_to_string(&index).unwrap(), "v1\n");

    // Rollback runs carry no artifact of their own
    assert!(matches!(
        h.engine.rollback(rollback.id, trigger.clone()).await,
        Err(EngineError::ArtifactNotFound(_))
    ));

    std::fs::remove_dir_all(h.history.layout().artifact_dir(build.id)).unwrap();
    assert!(matches!(
        h.engine.rollback(build.id, trigger).await,
        Err(EngineError::ArtifactNotFound(_))
    ));
}

#[tokio::test]
async fn retention_keeps_the_latest_success() {
    let h = Harness::new().await;
    let mut config = h
        .configuration("nightly", "echo build > out.bin", "out.bin")
        .await;
    config.retention_days = Some(1);
    h.store(&config).await;

    let older = h.finish(h.submit(config.id).await.id).await;
    let latest = h.finish(h.submit(config.id).await.id).await;
    assert_eq!(older.status, RunStatus::Succeeded);
    assert_eq!(latest.status, RunStatus::Succeeded);

    let mut failing = config.clone();
    failing.script = "exit 2".to_string();
    h.store(&failing).await;
    let failed = h.finish(h.submit(config.id).await.id).await;
    assert_eq!(failed.status, RunStatus::Failed);

    // Everything is past the window a week from now
    let later = chrono::Utc::now() + chrono::Duration::days(7);
    let report = h.history.sweep_retention(later).await.unwrap();
    assert_eq!(report.deleted_runs, 2);
    assert_eq!(report.retained_latest, 1);

    assert!(h.history.find(older.id).await.unwrap().is_none());
    assert!(h.history.find(failed.id).await.unwrap().is_none());
    assert!(!h.history.layout().artifact_dir(older.id).exists());
    assert!(!h.history.layout().log_file(older.id).exists());

    let kept = h.history.get(latest.id).await.unwrap();
    assert!(kept.is_rollback_eligible());

    let again = h.history.sweep_retention(later).await.unwrap();
    assert_eq!(again.deleted_runs, 0);

    assert!(matches!(
        h.engine
            .rollback(older.id, Trigger::new(TriggerSource::Rollback, "operator"))
            .await,
        Err(EngineError::RunNotFound(_))
    ));
}
