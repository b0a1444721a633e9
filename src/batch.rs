//! Batch definitions read by the dispatcher.
//!
//! A batch file is a JSON array of entries tagged by `command_type`:
//!
//! ```json
//! [
//!   {"command_type": "os", "command_name": "ls", "parameters": ["-l"]},
//!   {"command_type": "compute", "expression": "((30+10)*5+1)"}
//! ]
//! ```
//!
//! Any problem with the file aborts the whole batch; nothing is sent.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::command::Command;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("failed to read batch file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid batch JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry {index}: invalid command type {kind}")]
    UnknownCommandType { index: usize, kind: String },

    #[error("entry {index}: {source}")]
    InvalidEntry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command_type", rename_all = "lowercase")]
enum BatchEntry {
    Os {
        command_name: String,
        #[serde(default)]
        parameters: Vec<String>,
    },
    Compute {
        #[serde(alias = "expersion")]
        expression: String,
    },
}

impl From<BatchEntry> for Command {
    fn from(entry: BatchEntry) -> Self {
        match entry {
            BatchEntry::Os {
                command_name,
                parameters,
            } => Self::shell(command_name, parameters),
            BatchEntry::Compute { expression } => Self::expression(expression),
        }
    }
}

/// Parse a batch from JSON text.
pub fn parse_batch(json: &str) -> Result<Vec<Command>, BatchError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;

    entries
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            match value.get("command_type").and_then(serde_json::Value::as_str) {
                Some("os" | "compute") => {}
                other => {
                    return Err(BatchError::UnknownCommandType {
                        index,
                        kind: other.map_or_else(|| "(missing)".to_string(), |k| format!("'{k}'")),
                    })
                }
            }
            serde_json::from_value::<BatchEntry>(value)
                .map(Command::from)
                .map_err(|source| BatchError::InvalidEntry { index, source })
        })
        .collect()
}

/// Read and parse a batch file.
pub fn load_batch(path: &Path) -> Result<Vec<Command>, BatchError> {
    if !path.exists() {
        return Err(BatchError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| BatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let batch = parse_batch(&text)?;
    debug!(path = %path.display(), commands = batch.len(), "Loaded batch");
    Ok(batch)
}
