//! Source fetching
//!
//! The fetch stage asks a [`SourceFetcher`] to materialize a source snapshot
//! into the run's workspace. Errors are classified so the controller knows
//! which ones are worth another attempt.

use async_trait::async_trait;
use kiln_core::domain::configuration::SourceRef;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying, e.g. a dropped connection
    #[error("transient fetch error: {0}")]
    Transient(String),
    #[error("fetch failed: {0}")]
    Fatal(String),
}

/// Source-control collaborator
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches `source` into the (empty, existing) `workspace` directory
    ///
    /// # Returns
    /// Output lines to append to the run log
    async fn fetch(&self, source: &SourceRef, workspace: &Path) -> Result<Vec<String>, FetchError>;
}

/// Shallow `git clone` of the configured revision
pub struct GitFetcher {
    program: String,
}

impl GitFetcher {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source: &SourceRef, workspace: &Path) -> Result<Vec<String>, FetchError> {
        let mut command = Command::new(&self.program);
        command.arg("clone").arg("--depth").arg("1");
        if let Some(revision) = source.revision() {
            command.arg("--branch").arg(revision);
        }
        command
            .arg("--")
            .arg(&source.repository)
            .arg(workspace)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| FetchError::Fatal(format!("failed to run {}: {}", self.program, e)))?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();

        if output.status.success() {
            return Ok(lines);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!(
            "git clone exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
        lines.push(message.clone());

        if is_transient(&stderr) {
            Err(FetchError::Transient(message))
        } else {
            Err(FetchError::Fatal(message))
        }
    }
}

fn is_transient(stderr: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "could not resolve host",
        "connection timed out",
        "connection reset",
        "connection refused",
        "the remote end hung up unexpectedly",
        "temporary failure",
    ];
    let stderr = stderr.to_lowercase();
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(
            "fatal: unable to access 'https://x/': Could not resolve host: x"
        ));
        assert!(is_transient("fatal: the remote end hung up unexpectedly"));
        assert!(!is_transient(
            "fatal: Remote branch nope not found in upstream origin"
        ));
    }

    #[tokio::test]
    async fn test_missing_repository_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceRef {
            repository: dir.path().join("does-not-exist").display().to_string(),
            branch: None,
            tag: None,
        };

        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();

        let result = GitFetcher::new().fetch(&source, &workspace).await;
        assert!(matches!(result, Err(FetchError::Fatal(_))));
    }
}
