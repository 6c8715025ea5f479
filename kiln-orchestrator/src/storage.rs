//! On-disk layout of the data directory
//!
//! ```text
//! <data_dir>/
//!   workspaces/<run_id>/   fetched source, removed when the run ends
//!   artifacts/<run_id>/    packaged result files
//!   logs/<run_id>.log      flushed console output
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self, run_id: Uuid) -> PathBuf {
        self.root.join("workspaces").join(run_id.to_string())
    }

    pub fn artifact_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("artifacts").join(run_id.to_string())
    }

    pub fn log_file(&self, run_id: Uuid) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", run_id))
    }

    /// Creates the top-level directories
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in ["workspaces", "artifacts", "logs"] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    /// Removes a run's artifact directory and flushed log
    ///
    /// Missing files are not an error, so the call is idempotent.
    pub async fn remove_run_files(&self, run_id: Uuid) -> std::io::Result<()> {
        remove_dir_if_exists(&self.artifact_dir(run_id)).await?;
        match tokio::fs::remove_file(self.log_file(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolves `relative` inside `base`, refusing paths that escape it
pub fn contained_path(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return None;
    }
    Some(base.join(relative))
}
