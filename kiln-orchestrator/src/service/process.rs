//! Build script process supervision
//!
//! Spawns the configured script through the shell with stdout and stderr
//! piped. One reader task per stream forwards complete lines into a single
//! channel, so the receiver sees both streams interleaved in arrival order.
//! The channel is bounded; a slow consumer applies backpressure to the
//! readers, never to the child's exit.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// A running build script
pub struct ScriptProcess {
    child: Child,
}

impl ScriptProcess {
    /// Starts `script` with `shell -c` inside `workdir`
    ///
    /// # Returns
    /// The process and the receiving end of its merged output
    pub fn spawn(
        shell: &str,
        script: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
    ) -> std::io::Result<(Self, mpsc::Receiver<String>)> {
        let mut command = Command::new(shell);
        command
            .arg("-c")
            .arg(script)
            .current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so termination reaches everything the script started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok((Self { child }, rx))
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Asks the process to stop, forcing it after `grace`
    ///
    /// Returns the exit status if the process could be reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        self.signal("TERM").await;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for build process: {}", e),
            Err(_) => tracing::warn!(
                "Build process did not exit within {:?}, killing it",
                grace
            ),
        }

        self.signal("KILL").await;
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill build process: {}", e);
        }
        self.child.try_wait().ok().flatten()
    }

    /// Sends a signal to the whole process group
    #[cfg(unix)]
    async fn signal(&self, name: &str) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let result = Command::new("kill")
            .arg("-s")
            .arg(name)
            .arg("--")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to send SIG{} to build process {}: {}", name, pid, e);
        }
    }

    #[cfg(not(unix))]
    async fn signal(&self, _name: &str) {}
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Build output stream closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(output: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (mut process, mut output) = ScriptProcess::spawn(
            "sh",
            "echo one; echo two >&2; sleep 0.1; echo three",
            dir.path(),
            &HashMap::new(),
        )
        .unwrap();

        let mut lines = collect(&mut output).await;
        let status = process.wait().await.unwrap();
        assert!(status.success());

        assert_eq!(lines.last().map(String::as_str), Some("three"));
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_environment_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("KILN_TEST_VALUE".to_string(), "42".to_string())]);
        let (mut process, mut output) =
            ScriptProcess::spawn("sh", "echo value=$KILN_TEST_VALUE; exit 3", dir.path(), &env)
                .unwrap();

        let lines = collect(&mut output).await;
        assert_eq!(lines, vec!["value=42"]);
        assert_eq!(process.wait().await.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_script() {
        let dir = tempfile::tempdir().unwrap();
        let (mut process, _output) =
            ScriptProcess::spawn("sh", "sleep 30", dir.path(), &HashMap::new()).unwrap();

        let started = std::time::Instant::now();
        let status = process.terminate(Duration::from_secs(2)).await;
        assert!(status.is_some_and(|s| !s.success()));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
