//! Agent configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::{RetryPolicy, RunLimits};

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub model: ModelConfig,
    pub agent: LoopConfig,
    pub sandbox: SandboxConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-5-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 1.0,
            max_output_tokens: 4096,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum model calls per instance.
    pub max_steps: u32,
    pub retry: RetryPolicy,
    /// Optional wall-clock budget per instance, checked at step boundaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_timeout_secs: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            retry: RetryPolicy::default(),
            instance_timeout_secs: None,
        }
    }
}

impl LoopConfig {
    /// Limits for one run; the deadline clock starts now.
    pub fn limits(&self) -> RunLimits {
        RunLimits::new(self.max_steps)
            .with_retry(self.retry)
            .with_timeout(self.instance_timeout_secs.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Docker,
    Local,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    /// Per-command wall-clock limit for `run_bash_cmd`.
    pub command_timeout_secs: u64,
    /// Truncate stdout/stderr of each command beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Parent directory of local workspaces.
    pub workspaces_dir: PathBuf,
    /// Docker image name; `{id}` is replaced by the normalized instance id.
    pub image_template: String,
    /// Repository location inside the container.
    pub workdir: String,
    /// Leave workspaces/containers behind for inspection.
    pub keep_workspaces: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Docker,
            command_timeout_secs: 120,
            output_limit_bytes: 100_000,
            workspaces_dir: PathBuf::from("workspaces"),
            image_template: "swebench/sweb.eval.x86_64.{id}:latest".to_string(),
            workdir: "/testbed".to_string(),
            keep_workspaces: false,
        }
    }
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Size of the worker pool.
    pub workers: usize,
    pub output_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model.name must be non-empty"));
        }
        if self.model.api_key_env.trim().is_empty() {
            return Err(anyhow!("model.api_key_env must be non-empty"));
        }
        if !self.model.temperature.is_finite() || self.model.temperature < 0.0 {
            return Err(anyhow!("model.temperature must be a non-negative number"));
        }
        if self.model.max_output_tokens == 0 {
            return Err(anyhow!("model.max_output_tokens must be > 0"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.agent.instance_timeout_secs == Some(0) {
            return Err(anyhow!("agent.instance_timeout_secs must be > 0 when set"));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if !self.sandbox.image_template.contains("{id}") {
            return Err(anyhow!("sandbox.image_template must contain {{id}}"));
        }
        if self.orchestrator.workers == 0 {
            return Err(anyhow!("orchestrator.workers must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
