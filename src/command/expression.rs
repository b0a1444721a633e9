use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommandResult, ExecutionPolicy};
use crate::expr::Expression;

/// An arithmetic expression to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionCommand {
    pub expression: String,
}

impl ExpressionCommand {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    /// Parse, check every referenced name against the math allow-list, then
    /// evaluate. Syntax and evaluation errors are reported as failures.
    pub fn run(&self, policy: &ExecutionPolicy) -> CommandResult {
        let parsed = match Expression::parse(&self.expression) {
            Ok(parsed) => parsed,
            Err(e) => return CommandResult::failure(self.expression.clone(), e.to_string()),
        };

        if let Some(name) = parsed.names().iter().find(|n| !policy.allows_math(n)) {
            debug!(name = %name, "Rejected expression name");
            return CommandResult::not_allowed(self.expression.clone(), name);
        }

        match parsed.evaluate() {
            Ok(value) => CommandResult::success(self.expression.clone(), value.to_string()),
            Err(e) => CommandResult::failure(self.expression.clone(), e.to_string()),
        }
    }
}
