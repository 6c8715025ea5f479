//! Release method domain types

use serde::{Deserialize, Serialize};

/// How a packaged artifact is delivered to its destination
///
/// Serialized as a tagged object, e.g.
/// `{"method": "ssh", "host": "web-1", "port": 22, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ReleaseMethod {
    /// Build only, nothing is released
    None,

    /// Copy the artifact files into a directory on the orchestrator host
    LocalCopy {
        destination: String,
        #[serde(default)]
        clear_destination: bool,
    },

    /// Push the artifact files over SSH and optionally run a remote command
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: String,
        remote_dir: String,
        #[serde(default)]
        post_command: Option<String>,
    },

    /// Build a container image from the artifact directory and publish it
    ContainerImage {
        image: String,
        tag: String,
        #[serde(default)]
        dockerfile: Option<String>,
        #[serde(default = "default_true")]
        push: bool,
    },

    /// Upload the artifact into a project managed by a node agent
    NodeProject {
        node_url: String,
        project_id: String,
        #[serde(default)]
        clear_old: bool,
        #[serde(default)]
        restart: bool,
    },
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl ReleaseMethod {
    pub fn kind(&self) -> ReleaseKind {
        match self {
            ReleaseMethod::None => ReleaseKind::None,
            ReleaseMethod::LocalCopy { .. } => ReleaseKind::LocalCopy,
            ReleaseMethod::Ssh { .. } => ReleaseKind::Ssh,
            ReleaseMethod::ContainerImage { .. } => ReleaseKind::ContainerImage,
            ReleaseMethod::NodeProject { .. } => ReleaseKind::NodeProject,
        }
    }

    /// Whether the release stage runs at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReleaseMethod::None)
    }
}

/// Release method discriminant, used for display and outcome records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    None,
    LocalCopy,
    Ssh,
    ContainerImage,
    NodeProject,
}

impl std::fmt::Display for ReleaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseKind::None => write!(f, "none"),
            ReleaseKind::LocalCopy => write!(f, "local_copy"),
            ReleaseKind::Ssh => write!(f, "ssh"),
            ReleaseKind::ContainerImage => write!(f, "container_image"),
            ReleaseKind::NodeProject => write!(f, "node_project"),
        }
    }
}

/// Result of one release attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub method: ReleaseKind,
    pub success: bool,
    pub message: Option<String>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_method_tagged_json() {
        let method: ReleaseMethod = serde_json::from_value(serde_json::json!({
            "method": "ssh",
            "host": "web-1",
            "user": "deploy",
            "remote_dir": "/srv/web"
        }))
        .unwrap();

        assert_eq!(method.kind(), ReleaseKind::Ssh);
        match method {
            ReleaseMethod::Ssh {
                port, post_command, ..
            } => {
                assert_eq!(port, 22);
                assert!(post_command.is_none());
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_none_is_disabled() {
        assert!(!ReleaseMethod::None.is_enabled());
        assert!(
            ReleaseMethod::LocalCopy {
                destination: "/tmp/out".to_string(),
                clear_destination: false,
            }
            .is_enabled()
        );
    }
}
