//! command-dispatch library
//!
//! Sends batches of allow-listed commands from a dispatcher to a remote
//! worker over an authenticated, encrypted channel:
//! - Credential loading and the Noise-based secure channel
//! - Compressed binary envelopes for command and result batches
//! - The command model, including a sandboxed arithmetic evaluator
//! - Worker and dispatcher roles

pub mod backend;
pub mod batch;
pub mod codec;
pub mod command;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod expr;
pub mod transport;
pub mod worker;
