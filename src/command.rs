//! Command model.
//!
//! A [`Command`] is one of a closed set of variants. Each variant is
//! well-formed as soon as it exists but is only authorized when it runs:
//! [`Executor::run`] checks it against the worker's [`ExecutionPolicy`] and
//! always produces a [`CommandResult`], never an error.

mod expression;
mod shell;

pub use expression::ExpressionCommand;
pub use shell::ShellCommand;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::ShellBackend;
use crate::transport::protocol::CommandRecord;

/// A command sent by the dispatcher for the worker to run.
///
/// On the wire every command is a flat [`CommandRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CommandRecord", try_from = "CommandRecord")]
pub enum Command {
    /// Run an allow-listed executable through the host shell.
    Shell(ShellCommand),
    /// Evaluate an arithmetic expression over allow-listed names.
    Expression(ExpressionCommand),
}

impl Command {
    pub fn shell<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Shell(ShellCommand::new(name, args))
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression(ExpressionCommand::new(expression))
    }

    /// Short label used in logs.
    pub fn label(&self) -> &str {
        match self {
            Self::Shell(cmd) => &cmd.name,
            Self::Expression(cmd) => &cmd.expression,
        }
    }
}

/// Outcome of running one command.
///
/// `success` is false whenever the command was disallowed, malformed, or
/// failed while executing; `result` then carries the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub result: String,
    pub success: bool,
}

impl CommandResult {
    pub fn success(command: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            result: result.into(),
            success: true,
        }
    }

    pub fn failure(command: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            result: result.into(),
            success: false,
        }
    }

    fn not_allowed(command: impl Into<String>, name: &str) -> Self {
        Self::failure(command, format!("The use of '{name}' is not allowed"))
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command= {}, Success= {}, Result=\n{}\n{}",
            self.command,
            if self.success { "True" } else { "False" },
            "-".repeat(100),
            self.result
        )
    }
}

/// Allow-lists that gate what the worker will execute. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPolicy {
    shell_commands: BTreeSet<String>,
    math_names: BTreeSet<String>,
}

impl ExecutionPolicy {
    pub fn new<S, M>(shell_commands: S, math_names: M) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            shell_commands: shell_commands.into_iter().map(Into::into).collect(),
            math_names: math_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows_shell(&self, name: &str) -> bool {
        self.shell_commands.contains(name)
    }

    pub fn allows_math(&self, name: &str) -> bool {
        self.math_names.contains(name)
    }

    pub const fn shell_commands(&self) -> &BTreeSet<String> {
        &self.shell_commands
    }

    pub const fn math_names(&self) -> &BTreeSet<String> {
        &self.math_names
    }
}

/// Runs commands against a policy and a shell backend.
#[derive(Debug, Clone)]
pub struct Executor<B> {
    policy: Arc<ExecutionPolicy>,
    backend: Arc<B>,
}

impl<B: ShellBackend> Executor<B> {
    pub fn new(policy: ExecutionPolicy, backend: B) -> Self {
        Self {
            policy: Arc::new(policy),
            backend: Arc::new(backend),
        }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Run one command to completion.
    pub async fn run(&self, command: &Command) -> CommandResult {
        match command {
            Command::Shell(cmd) => cmd.run(&self.policy, self.backend.as_ref()).await,
            Command::Expression(cmd) => cmd.run(&self.policy),
        }
    }
}
