//! Batch execution: one agent run per instance, scheduled on the worker pool.
//!
//! Every instance always ends with a trajectory file and a predictions entry,
//! whatever went wrong in between. Failures stay inside the instance that
//! produced them.

use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use agent::actions::register_sandbox_actions;
use agent::cancel::CancelToken;
use agent::controller::{Agent, RunOutcome};
use agent::core::protocol::CallCodec;
use agent::core::types::{StepRecord, Termination, Turn};
use agent::io::call_log::CallLog;
use agent::io::config::AgentConfig;
use agent::io::prompt::PromptEngine;
use agent::io::sandbox::{Sandbox, SandboxTarget, open_sandbox};
use agent::io::trajectory::{Trajectory, remove_trajectory, trajectory_path, write_trajectory};
use agent::io::transport::{Model, OpenAiModel};
use agent::io::write_json;
use agent::registry::FunctionRegistry;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};

use crate::instance::Instance;
use crate::pool::{panic_message, run_pool};
use crate::predictions::{Prediction, PredictionsStore};

pub const RUN_META_FILE: &str = "run_meta.json";
/// Exit status recorded when the instance failed outside the loop.
pub const ERROR_STATUS: &str = "error";
const AGENT_NAME: &str = "swe-agent";

/// Source of per-instance models and sandboxes.
///
/// Called from worker threads; each call returns a fresh, unshared object.
pub trait Backend: Sync {
    /// Name recorded in predictions and trajectories.
    fn model_name(&self) -> &str;

    /// Model for one instance. `instance_dir` holds the instance's artifacts.
    fn model(&self, instance_dir: &Path) -> Result<Box<dyn Model>>;

    fn sandbox(&self, instance: &Instance) -> Result<Box<dyn Sandbox>>;
}

/// Chat-completions model plus the configured sandbox kind.
pub struct LiveBackend<'a> {
    config: &'a AgentConfig,
}

impl<'a> LiveBackend<'a> {
    pub fn new(config: &'a AgentConfig) -> Self {
        Self { config }
    }
}

impl Backend for LiveBackend<'_> {
    fn model_name(&self) -> &str {
        &self.config.model.name
    }

    fn model(&self, instance_dir: &Path) -> Result<Box<dyn Model>> {
        let model = OpenAiModel::new(&self.config.model, CallCodec::default().stop_marker())?
            .with_call_log(CallLog::in_dir(instance_dir)?);
        Ok(Box::new(model))
    }

    fn sandbox(&self, instance: &Instance) -> Result<Box<dyn Sandbox>> {
        let target = SandboxTarget {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            base_commit: instance.base_commit.clone(),
        };
        open_sandbox(&self.config.sandbox, &target)
    }
}

/// Shared, read-only state for every worker.
pub struct RunContext<'a> {
    pub output_dir: &'a Path,
    pub config: &'a AgentConfig,
    pub backend: &'a dyn Backend,
    pub store: &'a PredictionsStore,
    pub cancel: &'a CancelToken,
}

/// Summary of one processed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    pub instance_id: String,
    pub exit_status: String,
    pub steps: u32,
    pub patch_bytes: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Transcript {
    steps: Vec<StepRecord>,
    messages: Vec<Turn>,
    outcome: Option<RunOutcome>,
}

/// Process one instance end to end.
///
/// Never fails: errors and panics are logged and recorded in the trajectory,
/// and the prediction falls back to an empty patch.
#[instrument(skip_all, fields(instance_id = %instance.instance_id))]
pub fn process_instance(ctx: &RunContext<'_>, instance: &Instance) -> InstanceReport {
    let id = instance.instance_id.as_str();
    let instance_dir = ctx.output_dir.join(id);
    let traj_path = trajectory_path(ctx.output_dir, id);
    let started_at = Utc::now();
    info!("instance started");

    if let Err(err) = ctx.store.remove(id) {
        warn!(error = %format!("{err:#}"), "failed to clear stale prediction");
    }
    if let Err(err) = remove_trajectory(&traj_path) {
        warn!(error = %format!("{err:#}"), "failed to clear stale trajectory");
    }

    let mut transcript = Transcript::default();
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        attempt_instance(ctx, instance, &instance_dir, &mut transcript)
    }));
    let (patch, failure) = match attempt {
        Ok(result) => result,
        Err(payload) => (
            String::new(),
            Some(format!("panic: {}", panic_message(&*payload))),
        ),
    };

    if let Some(message) = &failure {
        error!(error = %message, "instance failed");
    }

    let exit_status = match (&failure, &transcript.outcome) {
        (None, Some(outcome)) => outcome.termination.label().to_string(),
        _ => ERROR_STATUS.to_string(),
    };
    let steps = transcript.outcome.as_ref().map_or(0, |outcome| outcome.steps);
    let patch_bytes = patch.len();

    let trajectory = Trajectory {
        instance_id: id.to_string(),
        model_name: ctx.backend.model_name().to_string(),
        exit_status: exit_status.clone(),
        result: patch.clone(),
        steps: transcript.steps,
        messages: transcript.messages,
        started_at,
        finished_at: Utc::now(),
        error: failure.clone(),
    };
    if let Err(err) = write_trajectory(&traj_path, &trajectory) {
        error!(error = %format!("{err:#}"), "failed to write trajectory");
    }

    let prediction = Prediction {
        instance_id: id.to_string(),
        model_name_or_path: ctx.backend.model_name().to_string(),
        model_patch: patch,
    };
    if let Err(err) = ctx.store.upsert(prediction) {
        error!(error = %format!("{err:#}"), "failed to update predictions");
    }

    info!(exit_status = %exit_status, steps, patch_bytes, "instance finished");
    InstanceReport {
        instance_id: id.to_string(),
        exit_status,
        steps,
        patch_bytes,
        error: failure,
    }
}

/// Open the sandbox, run the agent, and extract the patch.
///
/// Returns the patch (empty when unavailable) and the first failure, if any.
fn attempt_instance(
    ctx: &RunContext<'_>,
    instance: &Instance,
    instance_dir: &Path,
    transcript: &mut Transcript,
) -> (String, Option<String>) {
    let sandbox = match ctx.backend.sandbox(instance) {
        Ok(sandbox) => sandbox,
        Err(err) => return (String::new(), Some(format!("open sandbox: {err:#}"))),
    };
    let mut failure = run_agent(ctx, instance, instance_dir, sandbox.as_ref(), transcript)
        .err()
        .map(|err| format!("{err:#}"));
    let context = transcript
        .outcome
        .as_ref()
        .map(|outcome| outcome.result.as_str())
        .unwrap_or_default();
    let patch = match sandbox.generate_patch(context) {
        Ok(text) => text,
        Err(err) => {
            let message = format!("generate patch: {err:#}");
            warn!(error = %message, "patch generation failed");
            if failure.is_none() {
                failure = Some(message);
            }
            String::new()
        }
    };
    (patch, failure)
}

fn run_agent(
    ctx: &RunContext<'_>,
    instance: &Instance,
    instance_dir: &Path,
    sandbox: &dyn Sandbox,
    transcript: &mut Transcript,
) -> Result<()> {
    let mut model = ctx.backend.model(instance_dir).context("create model")?;
    let workdir = sandbox.workdir();
    let task = PromptEngine::new().render_instance(&instance.problem_statement, &workdir)?;

    let mut registry = FunctionRegistry::new();
    register_sandbox_actions(&mut registry, sandbox, ctx.config.sandbox.command_timeout())?;
    let mut agent =
        Agent::new(AGENT_NAME, CallCodec::default(), model.as_mut(), registry).with_workdir(workdir);
    let outcome = agent.run(&task, &ctx.config.agent.limits(), ctx.cancel);
    transcript.steps = agent.steps().to_vec();
    transcript.messages = agent.conversation().to_vec();
    transcript.outcome = Some(outcome?);
    Ok(())
}

/// Run-level manifest persisted to `run_meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub instances_path: String,
    /// SHA-256 of the instance file for reproducibility tracking.
    pub dataset_sha256: String,
    pub model_name: String,
    pub sandbox: String,
    pub workers: usize,
    pub max_steps: u32,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub scheduled: usize,
    pub completed: usize,
    /// Instances never started because the run was interrupted.
    pub skipped: usize,
    pub panicked: usize,
    pub errors: usize,
    pub exit_statuses: BTreeMap<String, usize>,
    pub interrupted: bool,
}

impl RunMeta {
    /// Every scheduled instance submitted without error.
    pub fn all_submitted(&self) -> bool {
        let submitted = self
            .exit_statuses
            .get(Termination::Submitted.label())
            .copied()
            .unwrap_or(0);
        !self.interrupted && self.panicked == 0 && submitted == self.scheduled
    }
}

/// Everything `run_all` needs besides the instances themselves.
pub struct RunRequest<'a> {
    pub instances_path: &'a Path,
    pub output_dir: &'a Path,
    pub config: &'a AgentConfig,
    pub backend: &'a dyn Backend,
    pub cancel: &'a CancelToken,
}

/// Process `instances` on the worker pool and write the run manifest.
#[instrument(skip_all, fields(instances = instances.len(), output_dir = %request.output_dir.display()))]
pub fn run_all(request: &RunRequest<'_>, instances: Vec<Instance>) -> Result<RunMeta> {
    fs::create_dir_all(request.output_dir)
        .with_context(|| format!("create {}", request.output_dir.display()))?;
    let dataset_sha256 = file_sha256(request.instances_path)?;
    let store = PredictionsStore::in_dir(request.output_dir);
    let ctx = RunContext {
        output_dir: request.output_dir,
        config: request.config,
        backend: request.backend,
        store: &store,
        cancel: request.cancel,
    };

    let scheduled = instances.len();
    let workers = request.config.orchestrator.workers;
    let started_at = Utc::now();
    info!(scheduled, workers, "batch started");

    let report = run_pool(instances, workers, request.cancel, |instance| {
        process_instance(&ctx, &instance)
    })?;
    let finished_at = Utc::now();

    let mut exit_statuses = BTreeMap::new();
    for instance in &report.results {
        *exit_statuses.entry(instance.exit_status.clone()).or_insert(0) += 1;
    }
    let errors = report.results.iter().filter(|r| r.error.is_some()).count();
    let meta = RunMeta {
        instances_path: request.instances_path.display().to_string(),
        dataset_sha256,
        model_name: request.backend.model_name().to_string(),
        sandbox: format!("{:?}", request.config.sandbox.kind).to_lowercase(),
        workers,
        max_steps: request.config.agent.max_steps,
        start_time: started_at.to_rfc3339(),
        end_time: finished_at.to_rfc3339(),
        duration_secs: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        scheduled,
        completed: report.results.len(),
        skipped: report.skipped,
        panicked: report.panicked,
        errors,
        exit_statuses,
        interrupted: request.cancel.is_cancelled(),
    };
    write_json(&run_meta_path(request.output_dir), &meta)?;
    info!(
        completed = meta.completed,
        skipped = meta.skipped,
        errors = meta.errors,
        "batch finished"
    );
    Ok(meta)
}

pub fn run_meta_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RUN_META_FILE)
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}
