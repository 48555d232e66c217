//! Container-backed sandbox driven through the `docker` CLI.
//!
//! One long-lived container per instance (`sleep infinity`), commands via
//! `docker exec`, removed with `docker rm -f` when dropped.

use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::error::EnvironmentError;
use crate::io::config::SandboxConfig;
use crate::io::process::{CommandOutput, TIMEOUT_EXIT_CODE, run_command_with_timeout};
use crate::io::sandbox::{CommandResult, Sandbox, SandboxTarget, session_name};

/// Budget for container lifecycle commands (image pulls can be slow).
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(600);
const FILE_IO_TIMEOUT: Duration = Duration::from_secs(60);
/// Seconds `timeout(1)` waits after SIGTERM before sending SIGKILL.
const KILL_AFTER_SECS: u64 = 5;
/// Extra time the host waits on `docker exec` beyond the in-container timeout.
const HOST_BACKSTOP_MARGIN: Duration = Duration::from_secs(KILL_AFTER_SECS + 10);
/// Patches are captured whole, independent of the observation limit.
const PATCH_OUTPUT_LIMIT: usize = 32 * 1024 * 1024;

/// Image name for an instance: `{id}` in the template is replaced by the
/// lowercased instance id with `__` spelled `_1776_`, the SWE-bench convention.
pub fn image_for(template: &str, instance_id: &str) -> String {
    let id = instance_id.replace("__", "_1776_").to_lowercase();
    template.replace("{id}", &id)
}

#[derive(Debug)]
pub struct DockerSandbox {
    container: String,
    workdir: String,
    baseline: String,
    output_limit_bytes: usize,
    keep: bool,
}

impl DockerSandbox {
    #[instrument(skip_all, fields(instance_id = %target.instance_id))]
    pub fn start(config: &SandboxConfig, target: &SandboxTarget) -> Result<Self> {
        let image = image_for(&config.image_template, &target.instance_id);
        let container = session_name("agent", &target.instance_id);
        info!(%image, %container, "starting container");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", container.as_str(), "-w", config.workdir.as_str()])
            .arg(&image)
            .args(["sleep", "infinity"]);
        let output = run_command_with_timeout(cmd, None, LIFECYCLE_TIMEOUT, 64 * 1024)
            .context("docker run")?;
        ensure_success("docker run", &output)?;

        let mut sandbox = Self {
            container,
            workdir: config.workdir.clone(),
            baseline: String::new(),
            output_limit_bytes: config.output_limit_bytes,
            keep: config.keep_workspaces,
        };
        sandbox.baseline = sandbox.head_sha()?;
        debug!(baseline = %sandbox.baseline, "container ready");
        Ok(sandbox)
    }

    fn head_sha(&self) -> Result<String> {
        let output = self.exec(&["git", "rev-parse", "HEAD"], None, FILE_IO_TIMEOUT)?;
        ensure_success("git rev-parse HEAD", &output)?;
        Ok(output.stdout_text().trim().to_string())
    }

    fn exec(&self, argv: &[&str], stdin: Option<&[u8]>, timeout: Duration) -> Result<CommandOutput> {
        self.exec_limited(argv, stdin, timeout, self.output_limit_bytes)
    }

    fn exec_limited(
        &self,
        argv: &[&str],
        stdin: Option<&[u8]>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args(["-w", self.workdir.as_str(), self.container.as_str()]).args(argv);
        run_command_with_timeout(cmd, stdin, timeout, output_limit_bytes)
    }
}

impl Sandbox for DockerSandbox {
    fn workdir(&self) -> String {
        self.workdir.clone()
    }

    #[instrument(skip_all, fields(container = %self.container, timeout_secs = timeout.as_secs()))]
    fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, EnvironmentError> {
        let argv = timed_argv(command, timeout);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let started = Instant::now();
        let output = self
            .exec(&argv, None, timeout + HOST_BACKSTOP_MARGIN)
            .map_err(|err| EnvironmentError::Execution(format!("{err:#}")))?;
        let timed_out =
            output.timed_out || killed_by_timeout(output.exit_code(), started.elapsed(), timeout);
        if timed_out && !output.timed_out {
            warn!(exit_code = output.exit_code(), "command killed by in-container timeout");
        }
        Ok(CommandResult {
            exit_code: if timed_out {
                TIMEOUT_EXIT_CODE
            } else {
                output.exit_code()
            },
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out,
        })
    }

    fn read_file(&self, path: &str) -> Result<String, EnvironmentError> {
        let output = self
            .exec(&["cat", "--", path], None, FILE_IO_TIMEOUT)
            .map_err(|err| EnvironmentError::Execution(format!("{err:#}")))?;
        if !output.status.success() {
            return Err(EnvironmentError::Execution(format!(
                "read {path}: {}",
                output.stderr_text().trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvironmentError> {
        let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
        let output = self
            .exec(
                &["sh", "-c", script, "sh", path],
                Some(contents.as_bytes()),
                FILE_IO_TIMEOUT,
            )
            .map_err(|err| EnvironmentError::Execution(format!("{err:#}")))?;
        if !output.status.success() {
            return Err(EnvironmentError::Execution(format!(
                "write {path}: {}",
                output.stderr_text().trim()
            )));
        }
        Ok(())
    }

    fn generate_patch(&self, _context: &str) -> Result<String> {
        let script = format!("git add -A && git diff --cached --no-color {}", self.baseline);
        let output = self.exec_limited(
            &["bash", "-c", script.as_str()],
            None,
            FILE_IO_TIMEOUT,
            PATCH_OUTPUT_LIMIT,
        )?;
        ensure_success("git diff", &output)?;
        if output.stdout_truncated > 0 {
            bail!(
                "patch exceeds output limit ({} bytes dropped)",
                output.stdout_truncated
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.keep {
            debug!(container = %self.container, "keeping container");
            return;
        }
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", self.container.as_str()]);
        match run_command_with_timeout(cmd, None, LIFECYCLE_TIMEOUT, 64 * 1024) {
            Ok(output) if output.status.success() => {
                debug!(container = %self.container, "container removed");
            }
            Ok(output) => {
                warn!(container = %self.container, stderr = %output.stderr_text().trim(), "docker rm failed");
            }
            Err(err) => warn!(container = %self.container, err = %err, "docker rm failed"),
        }
    }
}

/// Wrap `command` in `timeout(1)` so it dies inside the container, not just the host client.
fn timed_argv(command: &str, timeout: Duration) -> Vec<String> {
    vec![
        "timeout".to_string(),
        "-k".to_string(),
        KILL_AFTER_SECS.to_string(),
        format!("{}", timeout.as_secs_f64()),
        "bash".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

/// `timeout(1)` exits 124 after SIGTERM and 137 when it had to SIGKILL. Either only counts
/// once the budget has actually elapsed.
fn killed_by_timeout(exit_code: i32, elapsed: Duration, timeout: Duration) -> bool {
    matches!(exit_code, 124 | 137) && elapsed >= timeout
}

fn ensure_success(what: &str, output: &CommandOutput) -> Result<()> {
    if output.timed_out {
        return Err(anyhow!("{what} timed out"));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "{what} failed ({}): {}",
            output.exit_code(),
            output.stderr_text().trim()
        ));
    }
    Ok(())
}
