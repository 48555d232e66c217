//! Agent configuration merging.
//!
//! Applies command-line overrides on top of the TOML configuration.

use std::path::PathBuf;

use agent::io::config::{AgentConfig, SandboxKind};
use anyhow::Result;

/// Flags that take precedence over the config file when present.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub workers: Option<usize>,
    pub sandbox: Option<SandboxKind>,
    pub output_dir: Option<PathBuf>,
}

/// Apply overrides to the base config and validate the result.
pub fn apply_overrides(mut base: AgentConfig, overrides: &Overrides) -> Result<AgentConfig> {
    if let Some(model) = &overrides.model {
        base.model.name = model.clone();
    }
    if let Some(max_steps) = overrides.max_steps {
        base.agent.max_steps = max_steps;
    }
    if let Some(workers) = overrides.workers {
        base.orchestrator.workers = workers;
    }
    if let Some(kind) = overrides.sandbox {
        base.sandbox.kind = kind;
    }
    if let Some(output_dir) = &overrides.output_dir {
        base.orchestrator.output_dir = output_dir.clone();
    }
    base.validate()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_file_values_without_overrides() {
        let base = AgentConfig::default();
        let merged = apply_overrides(base.clone(), &Overrides::default()).expect("merge");
        assert_eq!(merged, base);
    }

    #[test]
    fn applies_overrides() {
        let overrides = Overrides {
            model: Some("gpt-4.1".to_string()),
            max_steps: Some(7),
            workers: Some(2),
            sandbox: Some(SandboxKind::Local),
            output_dir: Some(PathBuf::from("runs/a")),
        };
        let merged = apply_overrides(AgentConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.model.name, "gpt-4.1");
        assert_eq!(merged.agent.max_steps, 7);
        assert_eq!(merged.orchestrator.workers, 2);
        assert_eq!(merged.sandbox.kind, SandboxKind::Local);
        assert_eq!(merged.orchestrator.output_dir, PathBuf::from("runs/a"));
    }

    #[test]
    fn rejects_zero_workers() {
        let overrides = Overrides {
            workers: Some(0),
            ..Overrides::default()
        };
        assert!(apply_overrides(AgentConfig::default(), &overrides).is_err());
    }
}
