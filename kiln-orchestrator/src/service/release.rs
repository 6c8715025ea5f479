//! Release Executor
//!
//! Applies a packaged artifact to its release target. Local copies are done
//! in-process; the remote methods go through a [`ReleaseTransport`].
//! Node uploads are multipart HTTP requests, one per artifact file.
//!
//! The executor never retries. Every call yields exactly one
//! [`ReleaseOutcome`], and callers decide whether to try again.

use async_trait::async_trait;
use kiln_core::domain::release::{ReleaseKind, ReleaseMethod, ReleaseOutcome};
use kiln_core::domain::run::Artifact;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("release method {0} is not supported by this transport")]
    Unsupported(ReleaseKind),
    #[error("`{command}` exited with {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upload to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("node rejected {file} with {status}: {body}")]
    UploadRejected {
        file: String,
        status: u16,
        body: String,
    },
    #[error("release I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the transport is asked to deliver
pub struct ReleaseRequest<'a> {
    pub run_id: Uuid,
    pub method: &'a ReleaseMethod,
    pub artifact_dir: &'a Path,
    pub files: &'a [String],
}

/// Delivery mechanism for the remote release methods
#[async_trait]
pub trait ReleaseTransport: Send + Sync {
    /// Delivers the artifact
    ///
    /// # Returns
    /// Output lines to append to the run log
    async fn deliver(&self, request: &ReleaseRequest<'_>) -> Result<Vec<String>, ReleaseError>;
}

/// Result of one release call: the outcome plus the log lines it produced
#[derive(Debug, Clone)]
pub struct ReleaseReport {
    pub outcome: ReleaseOutcome,
    pub output: Vec<String>,
}

pub struct ReleaseExecutor {
    transport: Arc<dyn ReleaseTransport>,
}

impl ReleaseExecutor {
    pub fn new(transport: Arc<dyn ReleaseTransport>) -> Self {
        Self { transport }
    }

    /// Releases `artifact` with `method`
    pub async fn release(
        &self,
        run_id: Uuid,
        artifact: &Artifact,
        method: &ReleaseMethod,
    ) -> ReleaseReport {
        let kind = method.kind();
        let artifact_dir = PathBuf::from(&artifact.location);

        let result = match method {
            ReleaseMethod::None => Ok(vec!["No release method configured".to_string()]),
            ReleaseMethod::LocalCopy {
                destination,
                clear_destination,
            } => {
                copy_local(
                    &artifact_dir,
                    &artifact.files,
                    Path::new(destination),
                    *clear_destination,
                )
                .await
            }
            _ => {
                let request = ReleaseRequest {
                    run_id,
                    method,
                    artifact_dir: &artifact_dir,
                    files: &artifact.files,
                };
                self.transport.deliver(&request).await
            }
        };

        let finished_at = chrono::Utc::now();
        match result {
            Ok(output) => {
                tracing::info!("Run {} released via {}", run_id, kind);
                ReleaseReport {
                    outcome: ReleaseOutcome {
                        method: kind,
                        success: true,
                        message: None,
                        finished_at,
                    },
                    output,
                }
            }
            Err(e) => {
                tracing::warn!("Release of run {} via {} failed: {}", run_id, kind, e);
                ReleaseReport {
                    outcome: ReleaseOutcome {
                        method: kind,
                        success: false,
                        message: Some(e.to_string()),
                        finished_at,
                    },
                    output: vec![format!("Release failed: {}", e)],
                }
            }
        }
    }
}

/// Shells out to `scp`/`ssh` and `docker`; uploads to nodes over HTTP
#[derive(Default)]
pub struct CommandTransport {
    http: reqwest::Client,
}

impl CommandTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseTransport for CommandTransport {
    async fn deliver(&self, request: &ReleaseRequest<'_>) -> Result<Vec<String>, ReleaseError> {
        match request.method {
            ReleaseMethod::Ssh {
                host,
                port,
                user,
                remote_dir,
                post_command,
            } => {
                let target = format!("{}@{}", user, host);
                let port = port.to_string();
                let mut output = run(
                    "ssh",
                    &[
                        "-o", "BatchMode=yes", "-p", &port, &target, "mkdir", "-p", remote_dir,
                    ],
                )
                .await?;

                let mut scp_args: Vec<String> = vec![
                    "-o".into(),
                    "BatchMode=yes".into(),
                    "-P".into(),
                    port.clone(),
                    "-r".into(),
                ];
                scp_args.extend(top_level_entries(request.artifact_dir).await?);
                scp_args.push(format!("{}:{}/", target, remote_dir.trim_end_matches('/')));
                let scp_args: Vec<&str> = scp_args.iter().map(String::as_str).collect();
                output.extend(run("scp", &scp_args).await?);

                if let Some(command) = post_command.as_deref().filter(|c| !c.trim().is_empty()) {
                    output.extend(
                        run("ssh", &["-o", "BatchMode=yes", "-p", &port, &target, command]).await?,
                    );
                }
                Ok(output)
            }
            ReleaseMethod::ContainerImage {
                image,
                tag,
                dockerfile,
                push,
            } => {
                let reference = format!("{}:{}", image, tag);
                let context = request.artifact_dir.display().to_string();
                let mut args = vec!["build", "-t", reference.as_str()];
                if let Some(dockerfile) = dockerfile.as_deref() {
                    args.extend(["-f", dockerfile]);
                }
                args.push(context.as_str());

                let mut output = run("docker", &args).await?;
                if *push {
                    output.extend(run("docker", &["push", reference.as_str()]).await?);
                }
                Ok(output)
            }
            ReleaseMethod::NodeProject {
                node_url,
                project_id,
                clear_old,
                restart,
            } => {
                let url = format!(
                    "{}/api/projects/{}/upload",
                    node_url.trim_end_matches('/'),
                    project_id
                );
                let mut output = Vec::with_capacity(request.files.len());

                for (index, file) in request.files.iter().enumerate() {
                    // The old tree is cleared before the first file, the
                    // project restarted after the last one
                    let flags = UploadFlags {
                        clear_old: *clear_old && index == 0,
                        restart: *restart && index + 1 == request.files.len(),
                    };
                    let form = upload_form(request.artifact_dir, file, flags).await?;
                    output.push(self.upload(&url, file, form).await?);
                }
                Ok(output)
            }
            other => Err(ReleaseError::Unsupported(other.kind())),
        }
    }
}

impl CommandTransport {
    async fn upload(
        &self,
        url: &str,
        file: &str,
        form: reqwest::multipart::Form,
    ) -> Result<String, ReleaseError> {
        let http_error = |source| ReleaseError::Http {
            url: url.to_string(),
            source,
        };

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        let body = response.text().await.map_err(http_error)?;

        if !status.is_success() {
            return Err(ReleaseError::UploadRejected {
                file: file.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!("Uploaded {} to {}", file, url);
        Ok(format!("uploaded {}", file))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct UploadFlags {
    clear_old: bool,
    restart: bool,
}

/// Multipart body for one artifact file
///
/// `level_name` carries the file's directory inside the artifact so the node
/// rebuilds the same layout.
async fn upload_form(
    artifact_dir: &Path,
    file: &str,
    flags: UploadFlags,
) -> Result<reqwest::multipart::Form, ReleaseError> {
    let relative = Path::new(file);
    let contents = tokio::fs::read(artifact_dir.join(relative)).await?;
    let file_name = relative
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());

    let mut form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(contents).file_name(file_name),
        )
        .text("clear_old", flags.clear_old.to_string())
        .text("restart", flags.restart.to_string());

    let level = relative
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .filter(|parent| !parent.is_empty());
    if let Some(level) = level {
        form = form.text("level_name", level);
    }
    Ok(form)
}

async fn copy_local(
    artifact_dir: &Path,
    files: &[String],
    destination: &Path,
    clear_destination: bool,
) -> Result<Vec<String>, ReleaseError> {
    let artifact_dir = artifact_dir.to_path_buf();
    let destination = destination.to_path_buf();
    let files = files.to_vec();

    tokio::task::spawn_blocking(move || -> Result<Vec<String>, ReleaseError> {
        if clear_destination && destination.exists() {
            for entry in std::fs::read_dir(&destination)? {
                let path = entry?.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }

        std::fs::create_dir_all(&destination)?;
        let mut output = Vec::with_capacity(files.len());
        for file in &files {
            let target = destination.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(artifact_dir.join(file), &target)?;
            output.push(format!("copied {}", target.display()));
        }
        Ok(output)
    })
    .await
    .map_err(|e| ReleaseError::Io(std::io::Error::other(e)))?
}

async fn top_level_entries(dir: &Path) -> Result<Vec<String>, ReleaseError> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry.path().display().to_string());
    }
    entries.sort();
    Ok(entries)
}

async fn run(program: &str, args: &[&str]) -> Result<Vec<String>, ReleaseError> {
    let command = format!("{} {}", program, args.join(" "));
    tracing::debug!("Running release command: {}", command);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ReleaseError::Spawn {
            command: command.clone(),
            source,
        })?;

    let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(str::to_string)
        .collect();

    if !output.status.success() {
        return Err(ReleaseError::CommandFailed {
            command,
            code: output.status.code().unwrap_or(-1),
            output: lines.join("\n"),
        });
    }

    Ok(lines)
}
