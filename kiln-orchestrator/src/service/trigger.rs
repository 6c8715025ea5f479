//! Trigger Dispatcher
//!
//! Normalizes manual, API, hook, scheduled and rollback triggers into engine
//! calls and appends one audit record per attempt.

use kiln_core::domain::run::Run;
use kiln_core::domain::trigger::{Trigger, TriggerEvent, TriggerOutcome, TriggerSource};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::repository::configuration_repository;
use crate::service::engine::{Engine, EngineError};

/// Identity recorded when a caller does not name itself
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Deliberately carries no detail about which token was presented
    #[error("unauthorized")]
    Unauthorized,
    #[error("trigger source {0} cannot be submitted directly")]
    InvalidSource(TriggerSource),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, TriggerError>;

/// Result of a scheduled tick for one configuration
#[derive(Debug, Clone)]
pub enum ScheduledOutcome {
    Accepted(Run),
    /// The configuration was busy; nothing was queued
    Skipped { active_run: Uuid },
}

pub struct TriggerDispatcher {
    engine: Arc<Engine>,
}

impl TriggerDispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Operator or API submission
    ///
    /// # Arguments
    /// * `configuration_id` - Configuration to build
    /// * `source` - Either `Manual` or `Api`
    /// * `operator` - Identity recorded for audit
    /// * `branch` - Optional branch override
    pub async fn submit(
        &self,
        configuration_id: Uuid,
        source: TriggerSource,
        operator: Option<&str>,
        branch: Option<String>,
    ) -> Result<Run> {
        if !matches!(source, TriggerSource::Manual | TriggerSource::Api) {
            return Err(TriggerError::InvalidSource(source));
        }

        let trigger = Trigger::new(source, operator.unwrap_or(ANONYMOUS));
        let result = self.engine.submit(configuration_id, trigger.clone(), branch).await;
        self.audit(configuration_id, trigger, &result).await;
        Ok(result?)
    }

    /// Inbound hook call authenticated by the configuration's bearer token
    ///
    /// An unknown configuration and a wrong token are indistinguishable to
    /// the caller.
    pub async fn hook(
        &self,
        configuration_id: Uuid,
        token: &str,
        branch: Option<String>,
    ) -> Result<Run> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TriggerError::Unauthorized);
        }

        let pool = self.engine.services().history.pool();
        let config = configuration_repository::find_by_id(pool, configuration_id)
            .await
            .map_err(EngineError::from)?;
        let authorized = config.as_ref().is_some_and(|config| {
            config
                .triggers
                .webhook_token
                .as_deref()
                .is_some_and(|expected| tokens_match(expected, token))
        });
        let Some(config) = config.filter(|_| authorized) else {
            tracing::warn!(
                "Rejected hook call for configuration {} ({})",
                configuration_id,
                fingerprint(token)
            );
            return Err(TriggerError::Unauthorized);
        };

        let trigger = Trigger::new(TriggerSource::Webhook, fingerprint(token));
        let result = self.engine.submit(config.id, trigger.clone(), branch).await;
        self.audit(config.id, trigger, &result).await;
        Ok(result?)
    }

    /// Cron tick for a configuration
    ///
    /// A busy configuration is recorded as skipped instead of queued.
    pub async fn scheduled(&self, configuration_id: Uuid, cron: &str) -> Result<ScheduledOutcome> {
        let trigger = Trigger::new(TriggerSource::Scheduled, cron);
        let result = self.engine.submit(configuration_id, trigger.clone(), None).await;

        match result {
            Err(EngineError::AlreadyRunning { run_id, .. }) => {
                tracing::info!(
                    "Scheduled run of configuration {} skipped, run {} is active",
                    configuration_id,
                    run_id
                );
                self.record(TriggerEvent {
                    id: Uuid::new_v4(),
                    configuration_id,
                    trigger,
                    outcome: TriggerOutcome::Skipped,
                    run_id: Some(run_id),
                    detail: Some("configuration busy".to_string()),
                    at: chrono::Utc::now(),
                })
                .await;
                Ok(ScheduledOutcome::Skipped { active_run: run_id })
            }
            other => {
                self.audit(configuration_id, trigger, &other).await;
                Ok(ScheduledOutcome::Accepted(other?))
            }
        }
    }

    /// Redeploys the artifact of a historical run
    pub async fn rollback(&self, source_run: Uuid, operator: Option<&str>) -> Result<Run> {
        let trigger = Trigger::new(TriggerSource::Rollback, operator.unwrap_or(ANONYMOUS));
        let result = self.engine.rollback(source_run, trigger.clone()).await;

        // The audit trail hangs off the configuration of the source run
        let configuration_id = match &result {
            Ok(run) => Some(run.configuration_id),
            Err(_) => match self.engine.services().history.find(source_run).await {
                Ok(found) => found.map(|run| run.configuration_id),
                Err(e) => {
                    tracing::warn!("Failed to look up rollback source {}: {}", source_run, e);
                    None
                }
            },
        };
        if let Some(configuration_id) = configuration_id {
            self.audit(configuration_id, trigger, &result).await;
        }

        Ok(result?)
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    async fn audit(
        &self,
        configuration_id: Uuid,
        trigger: Trigger,
        result: &std::result::Result<Run, EngineError>,
    ) {
        let (outcome, run_id, detail) = match result {
            Ok(run) => (TriggerOutcome::Accepted, Some(run.id), None),
            Err(e) => (TriggerOutcome::Rejected, None, Some(e.to_string())),
        };

        self.record(TriggerEvent {
            id: Uuid::new_v4(),
            configuration_id,
            trigger,
            outcome,
            run_id,
            detail,
            at: chrono::Utc::now(),
        })
        .await;
    }

    async fn record(&self, event: TriggerEvent) {
        if let Err(e) = self.engine.services().history.record_trigger(&event).await {
            tracing::warn!(
                "Failed to record {} trigger of configuration {}: {}",
                event.trigger.source,
                event.configuration_id,
                e
            );
        }
    }
}

/// Compares digests so the time taken does not depend on a shared prefix
fn tokens_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// Short, stable identity for a hook token that never reveals the token
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}
