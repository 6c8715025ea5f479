//! Result packaging
//!
//! Collects the files selected by a configuration's result path into the
//! run's artifact directory. The result path is either a file, a directory
//! (copied recursively) or a glob evaluated relative to the workspace.

use globset::{Glob, GlobMatcher};
use kiln_core::domain::run::Artifact;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::storage::contained_path;

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("result path '{0}' escapes the workspace")]
    InvalidPath(String),
    #[error("invalid result pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("no files match result path '{0}'")]
    NoMatch(String),
    #[error("packaging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Copies the selected files into `dest` and returns the artifact manifest
///
/// Blocking; call from `spawn_blocking`.
pub fn package(workspace: &Path, result_path: &str, dest: &Path) -> Result<Artifact, PackageError> {
    let pattern = result_path.trim().trim_start_matches("./");
    let selected = collect(workspace, pattern)?;
    if selected.is_empty() {
        return Err(PackageError::NoMatch(result_path.to_string()));
    }

    std::fs::create_dir_all(dest)?;
    let mut files = Vec::with_capacity(selected.len());
    let mut size_bytes = 0;

    for (source, relative) in selected {
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        size_bytes += std::fs::copy(&source, &target)?;
        files.push(normalise(&relative));
    }
    files.sort();

    Ok(Artifact {
        location: dest.display().to_string(),
        files,
        size_bytes,
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Pairs of (absolute source, path relative to the artifact root)
fn collect(workspace: &Path, pattern: &str) -> Result<Vec<(PathBuf, PathBuf)>, PackageError> {
    if is_glob(pattern) {
        let matcher = matcher(pattern)?;
        return Ok(walk(workspace)
            .filter(|(_, rel)| matcher.is_match(rel))
            .collect());
    }

    let target = contained_path(workspace, pattern)
        .ok_or_else(|| PackageError::InvalidPath(pattern.to_string()))?;

    if target.is_file() {
        let name = target
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| PackageError::InvalidPath(pattern.to_string()))?;
        return Ok(vec![(target, name)]);
    }

    if target.is_dir() {
        return Ok(walk(&target).collect());
    }

    Ok(Vec::new())
}

fn walk(root: &Path) -> impl Iterator<Item = (PathBuf, PathBuf)> + '_ {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(move |entry| {
            let rel = entry.path().strip_prefix(root).ok()?.to_path_buf();
            Some((entry.into_path(), rel))
        })
}

fn matcher(pattern: &str) -> Result<GlobMatcher, PackageError> {
    if pattern.starts_with('/') || pattern.split('/').any(|part| part == "..") {
        return Err(PackageError::InvalidPath(pattern.to_string()));
    }

    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|source| PackageError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn normalise(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
