//! Run DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::RunStatus;
use crate::domain::trigger::TriggerSource;

/// Request to start a run of a configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRun {
    pub configuration_id: Uuid,
    /// Operator or API client identity recorded for audit
    #[serde(default)]
    pub operator: Option<String>,
    /// `manual` or `api`; other sources have dedicated entry points
    #[serde(default = "default_source")]
    pub source: TriggerSource,
    /// Build this branch instead of the configured one
    #[serde(default)]
    pub branch: Option<String>,
}

fn default_source() -> TriggerSource {
    TriggerSource::Manual
}

/// Accepted submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: Uuid,
    pub number: i64,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelResponse {
    Accepted,
}

/// Query parameters for listing runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunQuery {
    pub configuration_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    /// Only runs requested at or after this instant
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    /// Only runs requested strictly before this instant
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Oldest first instead of the default newest first
    #[serde(default)]
    pub ascending: bool,
}

/// Request to redeploy a historical run's artifact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub operator: Option<String>,
}

/// Body of an inbound hook call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookTrigger {
    #[serde(default)]
    pub branch: Option<String>,
}
