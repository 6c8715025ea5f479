//! Build configuration DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::configuration::{SourceRef, StageTimeouts};
use crate::domain::release::ReleaseMethod;

/// Request to create a build configuration, also used as the full
/// replacement body of an update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConfiguration {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub source: SourceRef,
    pub script: String,
    pub result_path: String,
    #[serde(default = "default_release")]
    pub release: ReleaseMethod,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub triggers: TriggerSettings,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub timeouts: StageTimeouts,
}

fn default_release() -> ReleaseMethod {
    ReleaseMethod::None
}

/// Trigger settings as submitted by an operator
///
/// The hook token itself is generated by the orchestrator, callers only
/// switch hook triggering on or off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub webhook: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: None,
            webhook: false,
        }
    }
}

/// Query parameters for listing configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationQuery {
    pub group: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// Hook endpoint of a configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerUrl {
    pub configuration_id: Uuid,
    /// Path to POST to, relative to the orchestrator base URL
    pub path: String,
    /// Sent as `Authorization: Bearer <token>`
    pub token: String,
}
