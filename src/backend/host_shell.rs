//! Host shell backend.
//!
//! Runs invocations as `<shell> -c <invocation>` on the worker's host.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ExecutionResult, ShellBackend};

/// Backend that spawns the host shell.
#[derive(Debug, Clone)]
pub struct HostShell {
    shell: PathBuf,
    timeout: Option<Duration>,
}

impl HostShell {
    /// Create a backend using `shell`, with no timeout.
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            timeout: None,
        }
    }

    /// Kill invocations that run longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HostShell {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl ShellBackend for HostShell {
    #[instrument(skip(self), fields(shell = %self.shell.display()))]
    async fn execute(&self, invocation: &str) -> Result<ExecutionResult> {
        debug!("Spawning shell");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(invocation)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn shell: {}", self.shell.display()))?;

        // Take pipe handles out so `child` stays in scope for kill-on-timeout
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        // Read both pipes concurrently so neither can fill up and stall the child.
        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) = match self.timeout {
            None => read_all.await?,
            Some(limit) => {
                if let Ok(result) = tokio::time::timeout(limit, read_all).await {
                    result?
                } else {
                    let _ = child.kill().await;
                    anyhow::bail!("Command timed out after {}s", limit.as_secs_f64());
                }
            }
        };

        let status = child.wait().await.context("Failed to wait for process")?;

        let result = ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };

        debug!(exit_code = result.exit_code, "Shell exited");

        Ok(result)
    }
}
