//! Per-instance execution environments the model's actions run against.
//!
//! A session is opened when an instance begins and released when the value
//! is dropped, whatever the outcome of the run.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::error::EnvironmentError;
use crate::io::config::{SandboxConfig, SandboxKind};
use crate::io::docker::DockerSandbox;
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid name regex"));

/// Result of one shell command. A timeout is reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    /// Text shown to the model for this command.
    pub fn render(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        if self.exit_code != 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[exit code {}]", self.exit_code));
        }
        text
    }
}

/// What a sandbox needs to know about the instance it hosts.
#[derive(Debug, Clone)]
pub struct SandboxTarget {
    pub instance_id: String,
    /// Repository as a local path, a git URL, or a GitHub `owner/name` slug.
    pub repo: String,
    /// Commit the pristine baseline is checked out at. Empty means the default branch.
    pub base_commit: String,
}

/// Isolated workspace for one instance.
pub trait Sandbox {
    /// Directory commands run in, as seen from inside the sandbox.
    fn workdir(&self) -> String;

    /// Run a shell command in the workspace with bounded output.
    fn run_command(&self, command: &str, timeout: Duration)
    -> Result<CommandResult, EnvironmentError>;

    fn read_file(&self, path: &str) -> Result<String, EnvironmentError>;

    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvironmentError>;

    /// Cumulative diff of the workspace against its pristine baseline.
    ///
    /// Empty when nothing was touched. Must be callable after any kind of
    /// run termination. `context` is the controller's final result text.
    fn generate_patch(&self, context: &str) -> Result<String>;
}

/// Open the sandbox kind selected by `config` for `target`.
pub fn open_sandbox(config: &SandboxConfig, target: &SandboxTarget) -> Result<Box<dyn Sandbox>> {
    let sandbox: Box<dyn Sandbox> = match config.kind {
        SandboxKind::Docker => Box::new(DockerSandbox::start(config, target)?),
        SandboxKind::Local => Box::new(LocalSandbox::create(config, target)?),
        SandboxKind::Noop => Box::new(NoopSandbox),
    };
    Ok(sandbox)
}

/// Filesystem-safe, collision-free session name for an instance.
pub fn session_name(prefix: &str, instance_id: &str) -> String {
    let safe = UNSAFE_NAME_CHARS.replace_all(instance_id, "_");
    let suffix: u32 = rand::thread_rng().gen_range(0..u32::MAX);
    format!("{prefix}-{safe}-{suffix:08x}")
}

/// Sandbox backed by a fresh git clone on the host.
///
/// Offers no isolation beyond a private directory; meant for trusted repos
/// and local development.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    git: Git,
    baseline: String,
    output_limit_bytes: usize,
    keep: bool,
}

impl LocalSandbox {
    #[instrument(skip_all, fields(instance_id = %target.instance_id))]
    pub fn create(config: &SandboxConfig, target: &SandboxTarget) -> Result<Self> {
        fs::create_dir_all(&config.workspaces_dir).with_context(|| {
            format!("create workspaces dir {}", config.workspaces_dir.display())
        })?;
        let root = config
            .workspaces_dir
            .join(session_name("ws", &target.instance_id));
        let git = Git::clone_into(&repo_source(&target.repo), &root)?;

        let mut sandbox = Self {
            root,
            git,
            baseline: String::new(),
            output_limit_bytes: config.output_limit_bytes,
            keep: config.keep_workspaces,
        };
        let commit = if target.base_commit.trim().is_empty() {
            "HEAD"
        } else {
            target.base_commit.trim()
        };
        sandbox.git.checkout_detached(commit)?;
        sandbox.baseline = sandbox.git.head_sha()?;
        info!(root = %sandbox.root.display(), baseline = %sandbox.baseline, "local workspace ready");
        Ok(sandbox)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, EnvironmentError> {
        let candidate = Path::new(path.trim());
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root)
                .map_err(|_| EnvironmentError::InvalidPath(path.to_string()))?
        } else {
            candidate
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(EnvironmentError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl Sandbox for LocalSandbox {
    fn workdir(&self) -> String {
        self.root.display().to_string()
    }

    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
    fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, EnvironmentError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).current_dir(&self.root);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|err| EnvironmentError::Execution(format!("{err:#}")))?;
        Ok(CommandResult {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }

    fn read_file(&self, path: &str) -> Result<String, EnvironmentError> {
        let resolved = self.resolve(path)?;
        fs::read_to_string(&resolved)
            .map_err(|err| EnvironmentError::Execution(format!("read {path}: {err}")))
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvironmentError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| EnvironmentError::Execution(format!("create dirs for {path}: {err}")))?;
        }
        fs::write(&resolved, contents)
            .map_err(|err| EnvironmentError::Execution(format!("write {path}: {err}")))
    }

    fn generate_patch(&self, _context: &str) -> Result<String> {
        self.git.staged_patch(&self.baseline)
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        if self.keep {
            debug!(root = %self.root.display(), "keeping workspace");
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), err = %err, "failed to remove workspace");
        }
    }
}

/// Dry-run environment: every command succeeds with empty output and the
/// patch is the controller's result text.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSandbox;

impl Sandbox for NoopSandbox {
    fn workdir(&self) -> String {
        ".".to_string()
    }

    fn run_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, EnvironmentError> {
        debug!(command, "noop sandbox ignoring command");
        Ok(CommandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        })
    }

    fn read_file(&self, path: &str) -> Result<String, EnvironmentError> {
        Err(EnvironmentError::Execution(format!(
            "{path}: the noop sandbox has no files"
        )))
    }

    fn write_file(&self, _path: &str, _contents: &str) -> Result<(), EnvironmentError> {
        Ok(())
    }

    fn generate_patch(&self, context: &str) -> Result<String> {
        Ok(context.to_string())
    }
}

/// Turn an instance `repo` field into something `git clone` accepts.
fn repo_source(repo: &str) -> String {
    let repo = repo.trim();
    let looks_local = repo.starts_with('/') || repo.starts_with('.') || Path::new(repo).exists();
    if looks_local || repo.contains("://") || repo.starts_with("git@") {
        return repo.to_string();
    }
    format!("https://github.com/{repo}.git")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn local_config(dir: &Path) -> SandboxConfig {
        SandboxConfig {
            kind: SandboxKind::Local,
            workspaces_dir: dir.to_path_buf(),
            ..SandboxConfig::default()
        }
    }

    fn target(repo: &TestRepo) -> SandboxTarget {
        SandboxTarget {
            instance_id: "demo__repo-1".to_string(),
            repo: repo.path_str(),
            base_commit: repo.head().expect("head"),
        }
    }

    #[test]
    fn untouched_workspace_has_empty_patch() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");

        assert_eq!(sandbox.generate_patch("").expect("patch"), "");
    }

    #[test]
    fn edited_workspace_patch_names_path() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");

        sandbox
            .write_file("src/fix.py", "print('fixed')\n")
            .expect("write");
        let patch = sandbox.generate_patch("").expect("patch");
        assert!(patch.contains("src/fix.py"));
        assert!(patch.contains("+print('fixed')"));
    }

    #[test]
    fn runs_commands_in_workspace() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");

        let result = sandbox
            .run_command("cat README.md; exit 2", Duration::from_secs(10))
            .expect("run");
        assert_eq!(result.exit_code, 2);
        assert!(result.stdout.contains("hello"));
        assert!(result.render().ends_with("[exit code 2]"));
    }

    #[test]
    fn timeout_is_reported_not_raised() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");

        let result = sandbox
            .run_command("exec sleep 5", Duration::from_millis(200))
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, crate::io::process::TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn rejects_paths_outside_workspace() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");

        let err = sandbox.read_file("../secret").expect_err("escape");
        assert!(matches!(err, EnvironmentError::InvalidPath(_)));
        let err = sandbox.read_file("/etc/passwd").expect_err("absolute");
        assert!(matches!(err, EnvironmentError::InvalidPath(_)));
    }

    #[test]
    fn workspace_removed_on_drop_unless_kept() {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::create(&local_config(temp.path()), &target(&repo))
            .expect("create");
        let root = sandbox.root().to_path_buf();
        assert!(root.exists());
        drop(sandbox);
        assert!(!root.exists());

        let mut config = local_config(temp.path());
        config.keep_workspaces = true;
        let sandbox = LocalSandbox::create(&config, &target(&repo)).expect("create");
        let root = sandbox.root().to_path_buf();
        drop(sandbox);
        assert!(root.exists());
    }

    #[test]
    fn noop_patch_is_context() {
        let sandbox = NoopSandbox;
        assert_eq!(sandbox.generate_patch("done").expect("patch"), "done");
        let result = sandbox
            .run_command("rm -rf /", Duration::from_secs(1))
            .expect("run");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn session_names_are_sanitized() {
        let name = session_name("ws", "owner/repo id");
        assert!(name.starts_with("ws-owner_repo_id-"));
        assert_ne!(name, session_name("ws", "owner/repo id"));
    }

    #[test]
    fn github_slugs_become_urls() {
        assert_eq!(
            repo_source("astropy/astropy"),
            "https://github.com/astropy/astropy.git"
        );
        assert_eq!(repo_source("/tmp/repo"), "/tmp/repo");
    }
}
