//! Test-only fakes: a scripted model, an in-memory sandbox, and a scratch git repo.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::error::{EnvironmentError, TransportError};
use crate::core::protocol::CallCodec;
use crate::core::types::{ParsedCall, Turn};
use crate::io::process::TIMEOUT_EXIT_CODE;
use crate::io::sandbox::{CommandResult, Sandbox};
use crate::io::transport::Model;

/// Render a well-formed response calling `name` with `args`.
pub fn call_text(thought: &str, name: &str, args: &[(&str, &str)]) -> String {
    CallCodec::default().encode(&ParsedCall {
        thought: thought.to_string(),
        name: name.to_string(),
        arguments: args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

/// Model that replays canned replies and then fails with `Exhausted`.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: VecDeque<Result<String, TransportError>>,
    repeat: Option<String>,
    calls: usize,
    seen: Vec<Vec<Turn>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = String>) -> Self {
        Self::with_replies(replies.into_iter().map(Ok))
    }

    pub fn with_replies(replies: impl IntoIterator<Item = Result<String, TransportError>>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Return `reply` forever.
    pub fn repeating(reply: String) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Conversations received, one per call.
    pub fn seen(&self) -> &[Vec<Turn>] {
        &self.seen
    }
}

impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&mut self, conversation: &[Turn]) -> Result<String, TransportError> {
        self.calls += 1;
        self.seen.push(conversation.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            return reply;
        }
        self.repeat.clone().ok_or(TransportError::Exhausted)
    }
}

/// In-memory sandbox with scripted command results.
///
/// Unscripted commands succeed with empty output. The patch lists every file
/// whose contents differ from the initial snapshot.
#[derive(Debug, Default)]
pub struct FakeSandbox {
    initial: BTreeMap<String, String>,
    files: RefCell<BTreeMap<String, String>>,
    scripted: HashMap<String, CommandResult>,
    commands: RefCell<Vec<String>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.initial.insert(path.to_string(), contents.to_string());
        self.files
            .get_mut()
            .insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_command(mut self, command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.scripted.insert(
            command.to_string(),
            CommandResult {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                timed_out: false,
            },
        );
        self
    }

    pub fn with_timeout(mut self, command: &str) -> Self {
        self.scripted.insert(
            command.to_string(),
            CommandResult {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            },
        );
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }
}

impl Sandbox for FakeSandbox {
    fn workdir(&self) -> String {
        "/fake".to_string()
    }

    fn run_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, EnvironmentError> {
        self.commands.borrow_mut().push(command.to_string());
        Ok(self
            .scripted
            .get(command)
            .cloned()
            .unwrap_or(CommandResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            }))
    }

    fn read_file(&self, path: &str) -> Result<String, EnvironmentError> {
        self.file(path)
            .ok_or_else(|| EnvironmentError::Execution(format!("read {path}: no such file")))
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvironmentError> {
        self.files
            .borrow_mut()
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn generate_patch(&self, _context: &str) -> Result<String> {
        let files = self.files.borrow();
        let mut patch = String::new();
        for (path, contents) in files.iter() {
            if self.initial.get(path) != Some(contents) {
                patch.push_str(&format!("diff --git a/{path} b/{path}\n"));
            }
        }
        Ok(patch)
    }
}

/// Scratch git repository with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        fs::write(repo.path().join("README.md"), "hello\n").context("write readme")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "--quiet", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_str(&self) -> String {
        self.path().display().to_string()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args([
                "-c",
                "user.name=Test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(self.path())
            .output()
            .context("spawn git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
