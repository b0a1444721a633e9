//! Shell backend trait and implementations.
//!
//! Backends run an already-authorized invocation and report what it wrote.
//! Authorization is the command model's job; the backend just handles
//! process management and I/O.

mod host_shell;

pub use host_shell::HostShell;

use anyhow::Result;
use async_trait::async_trait;

/// Result of running an invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code of the process (-1 if killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Trait for shell backends.
#[async_trait]
pub trait ShellBackend: Send + Sync {
    /// Run `invocation` through a shell and wait for it to exit.
    ///
    /// Errors are reserved for failures to spawn, read, or (when a timeout is
    /// configured) finish the process; a command that runs and complains on
    /// stderr is still `Ok`.
    async fn execute(&self, invocation: &str) -> Result<ExecutionResult>;
}
