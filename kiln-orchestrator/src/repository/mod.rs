//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository handles database operations for a specific domain entity.

pub mod configuration;
pub mod run;
pub mod trigger;

// Re-export for convenience
pub use configuration as configuration_repository;
pub use run as run_repository;
pub use trigger as trigger_repository;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::pool_in;
    use kiln_core::domain::configuration::{
        BuildConfiguration, SourceRef, StageTimeouts, TriggerPolicy,
    };
    use kiln_core::domain::release::ReleaseMethod;
    use kiln_core::domain::run::{Artifact, Run, RunKind, RunStatus};
    use kiln_core::domain::trigger::{Trigger, TriggerEvent, TriggerOutcome, TriggerSource};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn configuration(name: &str, group: Option<&str>) -> BuildConfiguration {
        let now = chrono::Utc::now();
        BuildConfiguration {
            id: Uuid::new_v4(),
            name: name.to_string(),
            group: group.map(str::to_string),
            source: SourceRef {
                repository: "file:///srv/repo".to_string(),
                branch: Some("main".to_string()),
                tag: None,
            },
            script: "make".to_string(),
            result_path: "out".to_string(),
            release: ReleaseMethod::None,
            retention_days: None,
            triggers: TriggerPolicy::default(),
            env_vars: HashMap::new(),
            timeouts: StageTimeouts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn run(config: &BuildConfiguration, number: i64, status: RunStatus) -> Run {
        Run {
            id: Uuid::new_v4(),
            configuration_id: config.id,
            number,
            kind: RunKind::Build,
            snapshot: config.clone(),
            status,
            trigger: Trigger::new(TriggerSource::Manual, "alice"),
            requested_at: chrono::Utc::now() + chrono::Duration::milliseconds(number),
            started_at: None,
            completed_at: None,
            exit_code: None,
            artifact: None,
            release: None,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_configuration_crud_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;

        let mut web = configuration("web", Some("frontend"));
        web.triggers.webhook_token = Some("tok-web".to_string());
        let api = configuration("api", Some("backend"));
        let misc = configuration("misc", None);
        for c in [&web, &api, &misc] {
            configuration_repository::create(&pool, c).await.unwrap();
        }

        let found = configuration_repository::find_by_id(&pool, web.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.triggers.webhook_token.as_deref(), Some("tok-web"));

        // Tokens stay unique across configurations
        let mut clash = configuration("clash", None);
        clash.triggers.webhook_token = Some("tok-web".to_string());
        assert!(configuration_repository::create(&pool, &clash).await.is_err());

        let all = configuration_repository::list(&pool, None, 10, 0).await.unwrap();
        let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["api", "misc", "web"]);

        let frontend = configuration_repository::list(&pool, Some("frontend"), 10, 0)
            .await
            .unwrap();
        assert_eq!(frontend.len(), 1);
        assert_eq!(
            configuration_repository::count(&pool, Some("backend")).await.unwrap(),
            1
        );

        let groups = configuration_repository::list_groups(&pool).await.unwrap();
        assert_eq!(groups, vec!["backend".to_string(), "frontend".to_string()]);

        web.name = "website".to_string();
        assert!(configuration_repository::update(&pool, &web).await.unwrap());
        let reloaded = configuration_repository::find_by_id(&pool, web.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.name, "website");

        assert!(configuration_repository::delete(&pool, misc.id).await.unwrap());
        assert!(!configuration_repository::delete(&pool, misc.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_active_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;
        let config = configuration("web", None);
        configuration_repository::create(&pool, &config).await.unwrap();

        assert_eq!(
            configuration_repository::reserve_run_number(&pool, config.id).await.unwrap(),
            1
        );

        let mut first = run(&config, 1, RunStatus::Queued);
        run_repository::create(&pool, &first).await.unwrap();
        assert_eq!(
            configuration_repository::reserve_run_number(&pool, config.id).await.unwrap(),
            2
        );

        let active = run_repository::find_active_for_configuration(&pool, config.id)
            .await
            .unwrap();
        assert_eq!(active.map(|r| r.id), Some(first.id));

        first.status = RunStatus::Succeeded;
        first.completed_at = Some(chrono::Utc::now());
        first.exit_code = Some(0);
        first.artifact = Some(Artifact {
            location: "/data/artifacts/x".to_string(),
            files: vec!["app.bin".to_string()],
            size_bytes: 12,
        });
        assert!(run_repository::update(&pool, &first).await.unwrap());

        let loaded = run_repository::find_by_id(&pool, first.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(loaded.artifact, first.artifact);
        assert_eq!(loaded.snapshot, config);
        assert!(
            run_repository::find_active_for_configuration(&pool, config.id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            run_repository::latest_success(&pool, config.id).await.unwrap(),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn test_run_numbers_survive_deleted_runs() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;
        let config = configuration("web", None);
        configuration_repository::create(&pool, &config).await.unwrap();

        for _ in 0..2 {
            let number = configuration_repository::reserve_run_number(&pool, config.id)
                .await
                .unwrap();
            run_repository::create(&pool, &run(&config, number, RunStatus::Failed))
                .await
                .unwrap();
        }
        let newest = run_repository::query(&pool, &run_repository::RunFilter::default(), 1, 0)
            .await
            .unwrap();
        assert_eq!(newest[0].number, 2);
        assert!(run_repository::delete_terminal(&pool, newest[0].id).await.unwrap());

        assert_eq!(
            configuration_repository::reserve_run_number(&pool, config.id)
                .await
                .unwrap(),
            3
        );

        // Updating the configuration keeps the counter
        configuration_repository::update(&pool, &config).await.unwrap();
        assert_eq!(
            configuration_repository::reserve_run_number(&pool, config.id)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_run_query_filters_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;
        let config = configuration("web", None);
        let other = configuration("api", None);

        for n in 1..=5 {
            let status = if n % 2 == 0 { RunStatus::Failed } else { RunStatus::Succeeded };
            run_repository::create(&pool, &run(&config, n, status)).await.unwrap();
        }
        run_repository::create(&pool, &run(&other, 1, RunStatus::Failed))
            .await
            .unwrap();

        let filter = run_repository::RunFilter {
            configuration_id: Some(config.id),
            ..Default::default()
        };
        let page = run_repository::query(&pool, &filter, 2, 0).await.unwrap();
        assert_eq!(page.iter().map(|r| r.number).collect::<Vec<_>>(), vec![5, 4]);
        assert_eq!(run_repository::count(&pool, &filter).await.unwrap(), 5);

        let failed = run_repository::RunFilter {
            configuration_id: Some(config.id),
            status: Some(RunStatus::Failed),
            ascending: true,
            ..Default::default()
        };
        let runs = run_repository::query(&pool, &failed, 10, 0).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.number).collect::<Vec<_>>(), vec![2, 4]);

        let everything = run_repository::RunFilter::default();
        assert_eq!(run_repository::count(&pool, &everything).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_delete_terminal_ignores_active_runs() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;
        let config = configuration("web", None);

        let active = run(&config, 1, RunStatus::Building);
        run_repository::create(&pool, &active).await.unwrap();
        assert!(!run_repository::delete_terminal(&pool, active.id).await.unwrap());

        let done = run(&config, 2, RunStatus::Failed);
        run_repository::create(&pool, &done).await.unwrap();
        assert!(run_repository::delete_terminal(&pool, done.id).await.unwrap());
        assert!(run_repository::find_by_id(&pool, done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_events_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(dir.path()).await;
        let config_id = Uuid::new_v4();

        for (i, outcome) in [TriggerOutcome::Accepted, TriggerOutcome::Skipped]
            .into_iter()
            .enumerate()
        {
            let event = TriggerEvent {
                id: Uuid::new_v4(),
                configuration_id: config_id,
                trigger: Trigger::new(TriggerSource::Scheduled, "*/5 * * * *"),
                outcome,
                run_id: None,
                detail: None,
                at: chrono::Utc::now() + chrono::Duration::seconds(i as i64),
            };
            trigger_repository::create(&pool, &event).await.unwrap();
        }

        let events = trigger_repository::list_by_configuration(&pool, config_id, 10, 0)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, TriggerOutcome::Skipped);
        assert_eq!(events[1].trigger.source, TriggerSource::Scheduled);
        assert_eq!(
            trigger_repository::count_by_configuration(&pool, config_id)
                .await
                .unwrap(),
            2
        );
    }
}
