//! Sandboxed arithmetic expression engine.
//!
//! Expressions are parsed into a small tree (numbers, arithmetic operators,
//! names, calls) and evaluated against a fixed table of math constants and
//! functions. There is no way for an expression to reach anything outside
//! that table: no imports, no attribute access, no host calls.

mod builtins;
mod eval;
mod lexer;
mod parser;
mod value;

pub use value::{format_float, Value};

use std::fmt;

use thiserror::Error;

/// Syntax error, with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {offset})")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Failure while evaluating a well-formed expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("{0}")]
    ZeroDivision(&'static str),

    #[error("math domain error")]
    MathDomain,

    #[error("math range error")]
    MathRange,

    #[error("{0}")]
    Overflow(String),

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Value(String),

    #[error("{0} are not supported")]
    Unsupported(&'static str),

    #[error("name '{0}' is not defined")]
    UnknownName(String),
}

/// A parsed expression, ready to be checked and evaluated.
#[derive(Clone, PartialEq)]
pub struct Expression {
    parsed: parser::ParsedExpr,
}

impl Expression {
    /// Parse `source` without evaluating it.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = lexer::tokenize(source)?;
        let parsed = parser::parse(&tokens)?;
        Ok(Self { parsed })
    }

    /// Every identifier the expression references (bare names, call targets
    /// and attribute names), deduplicated, in order of first appearance.
    pub fn names(&self) -> &[String] {
        &self.parsed.names
    }

    pub fn evaluate(&self) -> Result<Value, EvalError> {
        eval::evaluate(&self.parsed.root)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("names", &self.parsed.names)
            .finish_non_exhaustive()
    }
}

/// Names the evaluator can resolve. An allow-list may only contain these.
pub fn known_names() -> impl Iterator<Item = &'static str> {
    builtins::names()
}

pub fn is_known_name(name: &str) -> bool {
    builtins::lookup(name).is_some()
}
