//! Build configuration domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::release::ReleaseMethod;

/// Build configuration definition
///
/// Edited by an operator. A run copies the whole configuration at admission
/// time, so later edits never reach an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfiguration {
    pub id: Uuid,
    pub name: String,
    pub group: Option<String>,
    pub source: SourceRef,
    /// Shell script executed in the fetched workspace
    pub script: String,
    /// Path or glob (relative to the workspace) selecting the files to package
    pub result_path: String,
    pub release: ReleaseMethod,
    /// Days to keep terminal runs and their artifacts; `None` keeps forever
    pub retention_days: Option<u32>,
    pub triggers: TriggerPolicy,
    /// Extra environment variables passed to the build script
    pub env_vars: HashMap<String, String>,
    pub timeouts: StageTimeouts,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl BuildConfiguration {
    /// Returns true when only fields that never affect an in-flight run differ.
    pub fn differs_only_in_labels(&self, other: &BuildConfiguration) -> bool {
        self.source == other.source
            && self.script == other.script
            && self.result_path == other.result_path
            && self.release == other.release
            && self.retention_days == other.retention_days
            && self.triggers == other.triggers
            && self.env_vars == other.env_vars
            && self.timeouts == other.timeouts
    }
}

/// Where the source snapshot comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Repository identifier understood by the source fetcher (usually a clone URL)
    pub repository: String,
    pub branch: Option<String>,
    /// A tag takes precedence over the branch when both are set
    pub tag: Option<String>,
}

impl SourceRef {
    /// The ref the fetcher should check out, if any
    pub fn revision(&self) -> Option<&str> {
        self.tag.as_deref().or(self.branch.as_deref())
    }
}

/// Trigger policy of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPolicy {
    /// Master switch; a disabled configuration rejects every trigger
    pub enabled: bool,
    /// Cron expression (5 or 6 fields) for scheduled runs
    pub cron: Option<String>,
    /// Bearer token for inbound hooks; `None` disables hook triggering
    pub webhook_token: Option<String>,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: None,
            webhook_token: None,
        }
    }
}

/// Optional per-configuration stage budgets, in seconds
///
/// Unset values fall back to the orchestrator defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub fetch_seconds: Option<u64>,
    pub build_seconds: Option<u64>,
    pub package_seconds: Option<u64>,
    pub release_seconds: Option<u64>,
}
