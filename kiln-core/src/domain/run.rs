//! Run domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::configuration::BuildConfiguration;
use crate::domain::release::ReleaseOutcome;
use crate::domain::trigger::Trigger;

/// One execution of a build configuration
///
/// Created at admission, mutated only by its owning run controller, terminal
/// once `status` reaches a final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub configuration_id: Uuid,
    /// Monotonically increasing per configuration, starting at 1
    pub number: i64,
    pub kind: RunKind,
    /// Configuration as it was at admission time
    pub snapshot: BuildConfiguration,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub artifact: Option<Artifact>,
    pub release: Option<ReleaseOutcome>,
    pub failure: Option<RunFailure>,
}

impl Run {
    /// Whether this run still holds an artifact usable for redeploying
    pub fn is_rollback_eligible(&self) -> bool {
        self.artifact.is_some()
            && matches!(self.status, RunStatus::Succeeded | RunStatus::PartialSuccess)
    }
}

/// Whether a run builds from source or only re-releases an old artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunKind {
    Build,
    Rollback { source_run: Uuid },
}

/// Run status state machine
///
/// Happy path: `Queued → Fetching → Building → Packaging → Releasing → Succeeded`.
/// Every non-terminal state may move to `Cancelling` or (crash recovery, stage
/// error) `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Fetching,
    Building,
    Packaging,
    Releasing,
    Cancelling,
    Succeeded,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        RunStatus::Queued,
        RunStatus::Fetching,
        RunStatus::Building,
        RunStatus::Packaging,
        RunStatus::Releasing,
        RunStatus::Cancelling,
        RunStatus::Succeeded,
        RunStatus::PartialSuccess,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::PartialSuccess
                | RunStatus::Failed
                | RunStatus::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the state graph
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) => true,
            (Cancelling, Cancelled) => true,
            (Cancelling, _) => false,
            (_, Cancelling) => true,
            (Queued, Fetching) => true,
            // Rollback runs skip straight to the release stage
            (Queued, Releasing) => true,
            (Fetching, Building) => true,
            (Building, Packaging) => true,
            (Packaging, Releasing) => true,
            (Packaging, Succeeded) => true,
            (Releasing, Succeeded) => true,
            (Releasing, PartialSuccess) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Fetching => "fetching",
            RunStatus::Building => "building",
            RunStatus::Packaging => "packaging",
            RunStatus::Releasing => "releasing",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status '{}'", s))
    }
}

/// Stage of the fixed run sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Build,
    Package,
    Release,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Build => write!(f, "build"),
            Stage::Package => write!(f, "package"),
            Stage::Release => write!(f, "release"),
        }
    }
}

/// Packaged result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Directory holding the packaged files
    pub location: String,
    /// File paths relative to `location`
    pub files: Vec<String>,
    pub size_bytes: u64,
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub stage: Option<Stage>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Left non-terminal by a crashed orchestrator process
    Interrupted,
    StageTimeout,
    /// Build script exited with a non-zero code
    ProcessFailure,
    FetchFailed,
    PackageFailed,
    ReleaseFailed,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [Queued, Fetching, Building, Packaging, Releasing, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_terminal_states_never_move() {
        for from in [Succeeded, PartialSuccess, Failed, Cancelled] {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_regression() {
        assert!(!Building.can_transition_to(Fetching));
        assert!(!Releasing.can_transition_to(Building));
        assert!(!Packaging.can_transition_to(Queued));
        assert!(!Cancelling.can_transition_to(Building));
        assert!(!Cancelling.can_transition_to(Succeeded));
    }

    #[test]
    fn test_cancellation_edges() {
        for from in [Queued, Fetching, Building, Packaging, Releasing] {
            assert!(from.can_transition_to(Cancelling));
            assert!(!from.can_transition_to(Cancelled));
        }
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(Cancelling.can_transition_to(Failed));
    }

    #[test]
    fn test_partial_success_only_from_releasing() {
        assert!(Releasing.can_transition_to(PartialSuccess));
        assert!(!Packaging.can_transition_to(PartialSuccess));
        assert!(!Building.can_transition_to(PartialSuccess));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }
}
