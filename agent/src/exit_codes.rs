//! Stable exit codes for the agent and batch CLIs.

/// Every instance produced a result without an orchestration error.
pub const OK: i32 = 0;
/// Invalid configuration, instance file, or arguments.
pub const INVALID: i32 = 1;
/// The run finished but at least one instance errored or failed to submit.
pub const PARTIAL: i32 = 2;
/// Stopped by an interrupt (matches the shell's 128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
