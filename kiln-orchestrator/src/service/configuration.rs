//! Configuration Service
//!
//! Business logic for build configuration management. Edits and deletes
//! go through the engine's per-configuration admission section so they
//! never interleave with a run being admitted.

use kiln_core::domain::configuration::{BuildConfiguration, TriggerPolicy};
use kiln_core::domain::release::ReleaseMethod;
use kiln_core::dto::configuration::{ConfigurationQuery, CreateConfiguration, TriggerUrl};
use kiln_core::dto::page::{self, Page};
use uuid::Uuid;

use crate::repository::configuration_repository;
use crate::service::engine::Engine;
use crate::service::history::HistoryError;
use crate::service::scheduler::parse_cron;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("configuration {0} not found")]
    NotFound(Uuid),
    #[error("{0}")]
    Validation(String),
    /// Only name and group may change while a run is in flight
    #[error("configuration {configuration_id} has active run {run_id}")]
    RunActive { configuration_id: Uuid, run_id: Uuid },
    #[error("webhook triggering is disabled for configuration {0}")]
    WebhookDisabled(Uuid),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

/// Create a new configuration
pub async fn create_configuration(
    engine: &Engine,
    req: CreateConfiguration,
) -> Result<BuildConfiguration> {
    validate_configuration_request(&req)?;

    let now = chrono::Utc::now();
    let webhook_token = req.triggers.webhook.then(generate_token);
    let config = BuildConfiguration {
        id: Uuid::new_v4(),
        name: req.name.trim().to_string(),
        group: normalize_group(req.group),
        source: req.source,
        script: req.script,
        result_path: req.result_path.trim().to_string(),
        release: req.release,
        retention_days: req.retention_days,
        triggers: TriggerPolicy {
            enabled: req.triggers.enabled,
            cron: req.triggers.cron.filter(|c| !c.trim().is_empty()),
            webhook_token,
        },
        env_vars: req.env_vars,
        timeouts: req.timeouts,
        created_at: now,
        updated_at: now,
    };

    configuration_repository::create(pool(engine), &config).await?;
    tracing::info!("Configuration created: {} ({})", config.name, config.id);

    Ok(config)
}

/// Get a configuration by ID
pub async fn get_configuration(engine: &Engine, id: Uuid) -> Result<BuildConfiguration> {
    configuration_repository::find_by_id(pool(engine), id)
        .await?
        .ok_or(ConfigurationError::NotFound(id))
}

/// List configurations, optionally restricted to one group
pub async fn list_configurations(
    engine: &Engine,
    query: &ConfigurationQuery,
) -> Result<Page<BuildConfiguration>> {
    let (page, page_size, offset) = page::normalize(query.page, query.page_size);
    let group = query.group.as_deref().filter(|g| !g.is_empty());

    let total = configuration_repository::count(pool(engine), group).await?;
    let items = configuration_repository::list(pool(engine), group, page_size, offset).await?;

    Ok(Page {
        items,
        total: total as u64,
        page,
        page_size,
    })
}

/// Distinct group labels
pub async fn list_groups(engine: &Engine) -> Result<Vec<String>> {
    Ok(configuration_repository::list_groups(pool(engine)).await?)
}

/// Replace a configuration
///
/// While a run is active only `name` and `group` may change; the run keeps
/// the snapshot it was admitted with either way.
pub async fn update_configuration(
    engine: &Engine,
    id: Uuid,
    req: CreateConfiguration,
) -> Result<BuildConfiguration> {
    validate_configuration_request(&req)?;

    let _admission = engine.lock_configuration(id).await;
    let existing = get_configuration(engine, id).await?;

    let webhook_token = match (req.triggers.webhook, &existing.triggers.webhook_token) {
        (true, Some(token)) => Some(token.clone()),
        (true, None) => Some(generate_token()),
        (false, _) => None,
    };
    let updated = BuildConfiguration {
        id,
        name: req.name.trim().to_string(),
        group: normalize_group(req.group),
        source: req.source,
        script: req.script,
        result_path: req.result_path.trim().to_string(),
        release: req.release,
        retention_days: req.retention_days,
        triggers: TriggerPolicy {
            enabled: req.triggers.enabled,
            cron: req.triggers.cron.filter(|c| !c.trim().is_empty()),
            webhook_token,
        },
        env_vars: req.env_vars,
        timeouts: req.timeouts,
        created_at: existing.created_at,
        updated_at: chrono::Utc::now(),
    };

    if !existing.differs_only_in_labels(&updated) {
        ensure_no_active_run(engine, id).await?;
    }

    if !configuration_repository::update(pool(engine), &updated).await? {
        return Err(ConfigurationError::NotFound(id));
    }
    tracing::info!("Configuration updated: {} ({})", updated.name, id);

    Ok(updated)
}

/// Delete a configuration with its run history, artifacts and logs
pub async fn delete_configuration(engine: &Engine, id: Uuid) -> Result<()> {
    let _admission = engine.lock_configuration(id).await;
    get_configuration(engine, id).await?;
    ensure_no_active_run(engine, id).await?;

    let purged = engine.services().history.purge_configuration(id).await?;
    if !configuration_repository::delete(pool(engine), id).await? {
        return Err(ConfigurationError::NotFound(id));
    }

    tracing::info!("Configuration deleted: {} ({} run(s) purged)", id, purged);
    Ok(())
}

/// Replace the hook token; the old one stops working immediately
pub async fn reset_webhook_token(engine: &Engine, id: Uuid) -> Result<TriggerUrl> {
    let _admission = engine.lock_configuration(id).await;
    let mut config = get_configuration(engine, id).await?;

    let token = generate_token();
    config.triggers.webhook_token = Some(token.clone());
    config.updated_at = chrono::Utc::now();

    if !configuration_repository::update(pool(engine), &config).await? {
        return Err(ConfigurationError::NotFound(id));
    }
    tracing::info!("Webhook token reset for configuration {}", id);

    Ok(hook_url(id, token))
}

/// Hook endpoint of a configuration
pub async fn trigger_url(engine: &Engine, id: Uuid) -> Result<TriggerUrl> {
    let config = get_configuration(engine, id).await?;
    let token = config
        .triggers
        .webhook_token
        .ok_or(ConfigurationError::WebhookDisabled(id))?;
    Ok(hook_url(id, token))
}

// =============================================================================
// Helper Functions
// =============================================================================

fn pool(engine: &Engine) -> &sqlx::SqlitePool {
    engine.services().history.pool()
}

async fn ensure_no_active_run(engine: &Engine, id: Uuid) -> Result<()> {
    let active = match engine.services().history.active_for(id).await? {
        Some(run) => Some(run.id),
        None => engine.live_run(id),
    };
    if let Some(run_id) = active {
        return Err(ConfigurationError::RunActive {
            configuration_id: id,
            run_id,
        });
    }
    Ok(())
}

fn hook_url(configuration_id: Uuid, token: String) -> TriggerUrl {
    TriggerUrl {
        configuration_id,
        path: format!("/hook/{}", configuration_id),
        token,
    }
}

fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn normalize_group(group: Option<String>) -> Option<String> {
    group
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_configuration_request(req: &CreateConfiguration) -> Result<()> {
    let invalid = |msg: &str| Err(ConfigurationError::Validation(msg.to_string()));

    if req.name.trim().is_empty() {
        return invalid("Configuration name cannot be empty");
    }
    if req.name.chars().count() > MAX_NAME_LEN {
        return invalid("Configuration name is too long (max 255 characters)");
    }
    if req.source.repository.trim().is_empty() {
        return invalid("Source repository cannot be empty");
    }
    if req.script.trim().is_empty() {
        return invalid("Build script cannot be empty");
    }
    if req.result_path.trim().is_empty() {
        return invalid("Result path cannot be empty");
    }

    if let Some(cron) = req.triggers.cron.as_deref().filter(|c| !c.trim().is_empty()) {
        if let Err(e) = parse_cron(cron) {
            return Err(ConfigurationError::Validation(format!(
                "Invalid cron expression '{}': {}",
                cron, e
            )));
        }
    }

    if req.retention_days == Some(0) {
        return invalid("Retention must be at least one day");
    }

    for name in req.env_vars.keys() {
        if name.is_empty() || name.contains('=') || name.contains('\0') {
            return Err(ConfigurationError::Validation(format!(
                "Invalid environment variable name '{}'",
                name
            )));
        }
    }

    let timeouts = &req.timeouts;
    for seconds in [
        timeouts.fetch_seconds,
        timeouts.build_seconds,
        timeouts.package_seconds,
        timeouts.release_seconds,
    ]
    .into_iter()
    .flatten()
    {
        if seconds == 0 {
            return invalid("Stage timeouts must be greater than 0");
        }
    }

    validate_release(&req.release)
}

fn validate_release(method: &ReleaseMethod) -> Result<()> {
    let required = |value: &str, field: &str| {
        if value.trim().is_empty() {
            Err(ConfigurationError::Validation(format!(
                "Release parameter '{}' cannot be empty",
                field
            )))
        } else {
            Ok(())
        }
    };

    match method {
        ReleaseMethod::None => Ok(()),
        ReleaseMethod::LocalCopy { destination, .. } => required(destination, "destination"),
        ReleaseMethod::Ssh {
            host,
            port,
            user,
            remote_dir,
            ..
        } => {
            required(host, "host")?;
            required(user, "user")?;
            required(remote_dir, "remote_dir")?;
            if *port == 0 {
                return Err(ConfigurationError::Validation(
                    "Release parameter 'port' must be greater than 0".to_string(),
                ));
            }
            Ok(())
        }
        ReleaseMethod::ContainerImage { image, tag, .. } => {
            required(image, "image")?;
            required(tag, "tag")
        }
        ReleaseMethod::NodeProject {
            node_url,
            project_id,
            ..
        } => {
            required(node_url, "node_url")?;
            required(project_id, "project_id")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use kiln_core::domain::configuration::{SourceRef, StageTimeouts};
    use kiln_core::domain::run::RunStatus;
    use kiln_core::domain::trigger::{Trigger, TriggerSource};
    use kiln_core::dto::configuration::TriggerSettings;
    use std::collections::HashMap;

    fn request(name: &str) -> CreateConfiguration {
        CreateConfiguration {
            name: name.to_string(),
            group: Some("frontend".to_string()),
            source: SourceRef {
                repository: "fake://repo".to_string(),
                branch: Some("main".to_string()),
                tag: None,
            },
            script: "echo payload > app.bin".to_string(),
            result_path: "app.bin".to_string(),
            release: ReleaseMethod::None,
            retention_days: Some(14),
            triggers: TriggerSettings::default(),
            env_vars: HashMap::new(),
            timeouts: StageTimeouts::default(),
        }
    }

    #[test]
    fn test_validate_empty_name() {
        let req = request("  ");
        assert!(matches!(
            validate_configuration_request(&req),
            Err(ConfigurationError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_name_length_counts_characters() {
        assert!(validate_configuration_request(&request(&"é".repeat(255))).is_ok());
        assert!(validate_configuration_request(&request(&"a".repeat(256))).is_err());
    }

    #[test]
    fn test_validate_script_and_result_path() {
        let mut req = request("web");
        req.script = "   ".to_string();
        assert!(validate_configuration_request(&req).is_err());

        let mut req = request("web");
        req.result_path = String::new();
        assert!(validate_configuration_request(&req).is_err());
    }

    #[test]
    fn test_validate_cron() {
        let mut req = request("web");
        req.triggers.cron = Some("*/15 * * * *".to_string());
        assert!(validate_configuration_request(&req).is_ok());

        req.triggers.cron = Some("every day".to_string());
        assert!(validate_configuration_request(&req).is_err());
    }

    #[test]
    fn test_validate_release_parameters() {
        let mut req = request("web");
        req.release = ReleaseMethod::Ssh {
            host: "web-1".to_string(),
            port: 22,
            user: String::new(),
            remote_dir: "/srv".to_string(),
            post_command: None,
        };
        assert!(validate_configuration_request(&req).is_err());

        req.release = ReleaseMethod::ContainerImage {
            image: "registry/web".to_string(),
            tag: "latest".to_string(),
            dockerfile: None,
            push: true,
        };
        assert!(validate_configuration_request(&req).is_ok());
    }

    #[tokio::test]
    async fn test_create_with_webhook_generates_token() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;

        let mut req = request("web");
        req.triggers.webhook = true;
        let config = create_configuration(&t.engine, req).await.unwrap();
        let token = config.triggers.webhook_token.clone().unwrap();
        assert_eq!(token.len(), 64);

        let url = trigger_url(&t.engine, config.id).await.unwrap();
        assert_eq!(url.path, format!("/hook/{}", config.id));
        assert_eq!(url.token, token);

        let reset = reset_webhook_token(&t.engine, config.id).await.unwrap();
        assert_ne!(reset.token, token);
        let stored = get_configuration(&t.engine, config.id).await.unwrap();
        assert_eq!(stored.triggers.webhook_token, Some(reset.token));
    }

    #[tokio::test]
    async fn test_trigger_url_requires_webhook() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let config = create_configuration(&t.engine, request("web")).await.unwrap();

        assert!(matches!(
            trigger_url(&t.engine, config.id).await,
            Err(ConfigurationError::WebhookDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_group() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        create_configuration(&t.engine, request("web")).await.unwrap();
        let mut other = request("api");
        other.group = Some("backend".to_string());
        create_configuration(&t.engine, other).await.unwrap();

        let all = list_configurations(&t.engine, &ConfigurationQuery::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);

        let frontend = list_configurations(
            &t.engine,
            &ConfigurationQuery {
                group: Some("frontend".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(frontend.items.len(), 1);
        assert_eq!(frontend.items[0].name, "web");

        assert_eq!(
            list_groups(&t.engine).await.unwrap(),
            vec!["backend".to_string(), "frontend".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_while_running_allows_only_labels() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let mut req = request("web");
        req.script = "sleep 1; echo payload > app.bin".to_string();
        let config = create_configuration(&t.engine, req.clone()).await.unwrap();

        let run = t
            .engine
            .submit(config.id, Trigger::new(TriggerSource::Manual, "alice"), None)
            .await
            .unwrap();

        let mut edited = req.clone();
        edited.script = "make release".to_string();
        assert!(matches!(
            update_configuration(&t.engine, config.id, edited).await,
            Err(ConfigurationError::RunActive { run_id, .. }) if run_id == run.id
        ));

        let mut renamed = req.clone();
        renamed.name = "web-frontend".to_string();
        let updated = update_configuration(&t.engine, config.id, renamed).await.unwrap();
        assert_eq!(updated.name, "web-frontend");

        let done = t.engine.wait(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.snapshot.name, "web");
    }

    #[tokio::test]
    async fn test_delete_refused_while_running_then_purges() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let mut req = request("web");
        req.script = "sleep 1; echo payload > app.bin".to_string();
        let config = create_configuration(&t.engine, req).await.unwrap();

        let run = t
            .engine
            .submit(config.id, Trigger::new(TriggerSource::Manual, "alice"), None)
            .await
            .unwrap();
        assert!(matches!(
            delete_configuration(&t.engine, config.id).await,
            Err(ConfigurationError::RunActive { .. })
        ));

        let done = t.engine.wait(run.id).await.unwrap();
        let artifact_dir = t.history.layout().artifact_dir(done.id);
        assert!(artifact_dir.exists());

        delete_configuration(&t.engine, config.id).await.unwrap();
        assert!(matches!(
            get_configuration(&t.engine, config.id).await,
            Err(ConfigurationError::NotFound(_))
        ));
        assert!(t.history.find(run.id).await.unwrap().is_none());
        assert!(!artifact_dir.exists());
    }
}
