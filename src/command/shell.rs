use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommandResult, ExecutionPolicy};
use crate::backend::ShellBackend;

/// An executable name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The command line handed to the shell: the name followed by the
    /// space-joined arguments, trimmed.
    pub fn invocation(&self) -> String {
        format!("{} {}", self.name, self.args.join(" "))
            .trim()
            .to_string()
    }

    /// Run the command if its name is allow-listed.
    ///
    /// Anything written to stderr marks the run as failed and becomes the
    /// result text; otherwise stdout is the result.
    pub async fn run<B>(&self, policy: &ExecutionPolicy, backend: &B) -> CommandResult
    where
        B: ShellBackend + ?Sized,
    {
        if !policy.allows_shell(&self.name) {
            debug!(name = %self.name, "Rejected shell command");
            return CommandResult::not_allowed(self.name.clone(), &self.name);
        }

        let invocation = self.invocation();
        match backend.execute(&invocation).await {
            Ok(output) if !output.stderr.is_empty() => {
                CommandResult::failure(invocation, output.stderr)
            }
            Ok(output) => CommandResult::success(invocation, output.stdout),
            Err(e) => CommandResult::failure(invocation, format!("{e:#}")),
        }
    }
}
