//! Git adapter for workspace preparation and patch extraction.
//!
//! Patches are always computed against the commit a workspace was checked out
//! at, so the wrapper stays small and explicit around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `source` into `dest` without checking out a branch.
    ///
    /// `source` may be a local path or any URL git understands.
    #[instrument(skip_all, fields(source, dest = %dest.display()))]
    pub fn clone_into(source: &str, dest: &Path) -> Result<Self> {
        let output = Command::new("git")
            .arg("clone")
            .arg("--quiet")
            .arg("--no-checkout")
            .arg(source)
            .arg(dest)
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone {source} failed: {}", stderr.trim()));
        }
        debug!("cloned repository");
        Ok(Self::new(dest))
    }

    /// Check out `commit` on a detached HEAD.
    #[instrument(skip_all, fields(commit))]
    pub fn checkout_detached(&self, commit: &str) -> Result<()> {
        self.run_checked(&["checkout", "--quiet", "--detach", commit])?;
        Ok(())
    }

    /// Return the full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Unified diff of everything staged against `base`.
    pub fn diff_cached(&self, base: &str) -> Result<String> {
        self.run_capture(&["diff", "--cached", "--no-color", base])
    }

    /// Stage the whole worktree and diff it against `base`.
    ///
    /// An untouched worktree yields an empty string.
    #[instrument(skip_all, fields(base))]
    pub fn staged_patch(&self, base: &str) -> Result<String> {
        self.add_all()?;
        let patch = self.diff_cached(base)?;
        debug!(bytes = patch.len(), "computed patch");
        Ok(patch)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
