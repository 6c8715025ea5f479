//! Trigger domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Operator action from the console or CLI
    Manual,
    /// Programmatic call to the API
    Api,
    /// Inbound hook authenticated by a configuration token
    Webhook,
    /// Cron schedule
    Scheduled,
    /// Redeploy of a historical artifact
    Rollback,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Api => write!(f, "api"),
            TriggerSource::Webhook => write!(f, "webhook"),
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::Rollback => write!(f, "rollback"),
        }
    }
}

/// Trigger source plus the identity recorded for audit
///
/// The identity is an operator id, a cron expression, or a hook token
/// fingerprint depending on the source. Never the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub source: TriggerSource,
    pub identity: String,
}

impl Trigger {
    pub fn new(source: TriggerSource, identity: impl Into<String>) -> Self {
        Self {
            source,
            identity: identity.into(),
        }
    }
}

/// Outcome of a trigger attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted,
    /// A scheduled tick found the configuration busy; nothing was queued
    Skipped,
    Rejected,
}

/// Audit record of one trigger attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub trigger: Trigger,
    pub outcome: TriggerOutcome,
    pub run_id: Option<Uuid>,
    pub detail: Option<String>,
    pub at: chrono::DateTime<chrono::Utc>,
}
