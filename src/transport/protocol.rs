//! Wire records carried inside an envelope.
//!
//! Commands travel as flat records tagged by `type` so the worker can decode
//! a batch even when some entries are of a kind it does not handle.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{Command, ExpressionCommand, ShellCommand};

/// Record tag for shell commands.
pub const SHELL_KIND: &str = "os";

/// Record tag for expression commands.
pub const EXPRESSION_KIND: &str = "compute";

/// A command as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// `os` or `compute`; anything else is unrecognized.
    #[serde(rename = "type")]
    pub kind: String,
    /// Executable name (shell records).
    pub name: Option<String>,
    /// Executable arguments (shell records).
    pub args: Vec<String>,
    /// Expression source (compute records).
    pub expression: Option<String>,
}

/// A record that does not describe any known command variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized command record of type '{kind}'")]
pub struct UnrecognizedRecord {
    pub kind: String,
}

impl From<Command> for CommandRecord {
    fn from(command: Command) -> Self {
        match command {
            Command::Shell(ShellCommand { name, args }) => Self {
                kind: SHELL_KIND.to_string(),
                name: Some(name),
                args,
                expression: None,
            },
            Command::Expression(ExpressionCommand { expression }) => Self {
                kind: EXPRESSION_KIND.to_string(),
                name: None,
                args: Vec::new(),
                expression: Some(expression),
            },
        }
    }
}

impl TryFrom<CommandRecord> for Command {
    type Error = UnrecognizedRecord;

    fn try_from(record: CommandRecord) -> Result<Self, Self::Error> {
        match (record.kind.as_str(), record.name, record.expression) {
            (SHELL_KIND, Some(name), None) => Ok(Self::Shell(ShellCommand {
                name,
                args: record.args,
            })),
            (EXPRESSION_KIND, None, Some(expression)) if record.args.is_empty() => {
                Ok(Self::Expression(ExpressionCommand { expression }))
            }
            _ => Err(UnrecognizedRecord { kind: record.kind }),
        }
    }
}
