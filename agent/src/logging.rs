//! Diagnostic tracing for the agent and batch binaries.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is not a
//! run artifact: trajectories, call logs and predictions are written by
//! `io::trajectory`, `io::call_log` and the batch crate regardless of the
//! log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_level` when unset or invalid.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=agent=debug,batch=info batch run --instances tasks.jsonl
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
