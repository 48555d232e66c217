//! Out-of-process evaluation harness invocation.
//!
//! The harness consumes `preds.json` and grades each patch in its own
//! container. Its failure never invalidates the batch run: the caller reports
//! it along with the command to rerun by hand.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

pub const HARNESS_LOG_FILE: &str = "evaluation.log";

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub python: String,
    pub dataset_name: String,
    pub predictions_path: PathBuf,
    pub max_workers: usize,
    /// Harness run id; the output directory name.
    pub run_id: String,
}

impl EvaluationRequest {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-m".to_string(),
            "swebench.harness.run_evaluation".to_string(),
            "--dataset_name".to_string(),
            self.dataset_name.clone(),
            "--predictions_path".to_string(),
            self.predictions_path.display().to_string(),
            "--max_workers".to_string(),
            self.max_workers.to_string(),
            "--run_id".to_string(),
            self.run_id.clone(),
        ]
    }

    /// Shell-ready command line for rerunning the evaluation manually.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.python.clone()];
        parts.extend(self.args());
        parts.join(" ")
    }
}

/// `DOCKER_HOST` to export for a rootless daemon, if any.
///
/// Only applies when the variable is unset and `<runtime_dir>/docker.sock`
/// exists.
pub fn rootless_docker_host(current: Option<&str>, runtime_dir: &Path) -> Option<String> {
    if current.is_some_and(|value| !value.is_empty()) {
        return None;
    }
    let socket = runtime_dir.join("docker.sock");
    socket
        .exists()
        .then(|| format!("unix://{}", socket.display()))
}

#[cfg(unix)]
fn user_runtime_dir() -> Option<PathBuf> {
    use std::os::unix::fs::MetadataExt;
    let uid = fs::metadata("/proc/self").ok()?.uid();
    Some(PathBuf::from(format!("/run/user/{uid}")))
}

#[cfg(not(unix))]
fn user_runtime_dir() -> Option<PathBuf> {
    None
}

/// Run the harness with its combined output captured to `log_path`.
#[instrument(skip_all, fields(run_id = %request.run_id))]
pub fn run_evaluation(request: &EvaluationRequest, log_path: &Path) -> Result<ExitStatus> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create logs dir {}", parent.display()))?;
    }

    let mut command = Command::new(&request.python);
    command.args(request.args());
    let current = std::env::var("DOCKER_HOST").ok();
    if let Some(host) =
        user_runtime_dir().and_then(|dir| rootless_docker_host(current.as_deref(), &dir))
    {
        debug!(docker_host = %host, "using rootless docker socket");
        command.env("DOCKER_HOST", host);
    }

    info!(command = %request.command_line(), "running evaluation harness");
    let output = command
        .output()
        .with_context(|| format!("run {}", request.command_line()))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    fs::write(log_path, combined).with_context(|| format!("write log {}", log_path.display()))?;

    Ok(output.status)
}
