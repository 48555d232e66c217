//! Error kinds the controller branches on.
//!
//! Every variant here is recoverable at some boundary: protocol, dispatch and
//! environment errors are fed back to the model as observations, transport
//! errors end one instance run.

use thiserror::Error;

/// Malformed model output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("missing begin marker {marker}")]
    MissingBegin { marker: String },
    #[error("missing end marker {marker}")]
    MissingEnd { marker: String },
    #[error("end marker appears before the last begin marker")]
    EndBeforeBegin,
    #[error("function call block is empty")]
    EmptyBlock,
    #[error("function name is empty")]
    EmptyName,
    #[error("argument {index} is missing the {marker} separator")]
    MissingValueSeparator { index: usize, marker: String },
    #[error("argument {index} has an empty name")]
    EmptyArgumentName { index: usize },
}

/// Failure talking to the model backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response malformed: {0}")]
    MalformedResponse(String),
    #[error("model script exhausted")]
    Exhausted,
}

/// Rejected dispatch of a parsed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown action '{name}' (available: {available})")]
    UnknownAction { name: String, available: String },
    #[error("action '{name}' missing required arguments: {missing}")]
    MissingArguments { name: String, missing: String },
}

/// Fault inside the sandboxed environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("command execution failed: {0}")]
    Execution(String),
    #[error("path '{0}' escapes the workspace")]
    InvalidPath(String),
}
