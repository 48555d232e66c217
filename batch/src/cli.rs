//! CLI command implementations.

use std::path::{Path, PathBuf};

use agent::cancel::CancelToken;
use agent::exit_codes;
use agent::io::config::{SandboxKind, load_config};
use anyhow::{Context, Result, bail};
use clap::Args;
use regex::Regex;
use tracing::{debug, info};

use crate::config::{Overrides, apply_overrides};
use crate::harness::{EvaluationRequest, HARNESS_LOG_FILE, run_evaluation};
use crate::instance::{Slice, load_instances, select};
use crate::predictions::PredictionsStore;
use crate::report::aggregate;
use crate::run::{LiveBackend, RunRequest, run_all};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON array or JSONL file of task instances.
    #[arg(long)]
    pub instances: PathBuf,
    /// Path to the TOML config (defaults apply when missing).
    #[arg(long, default_value = "agent.toml")]
    pub config: PathBuf,
    /// Output directory (overrides `orchestrator.output_dir`).
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub max_steps: Option<u32>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long, value_enum)]
    pub sandbox: Option<SandboxKind>,
    /// Only run instances whose id matches this regex.
    #[arg(long)]
    pub filter: Option<String>,
    /// `start:end` range applied after the filter.
    #[arg(long)]
    pub slice: Option<String>,
    /// Grade the predictions with the SWE-bench harness afterwards.
    #[arg(long)]
    pub run_evaluation: bool,
    #[arg(long, default_value = "princeton-nlp/SWE-bench_Verified")]
    pub dataset_name: String,
    #[arg(long, default_value_t = 8)]
    pub eval_max_workers: usize,
    /// Interpreter with the `swebench` package installed.
    #[arg(long, default_value = "python")]
    pub python: String,
}

/// Run the agent over the selected instances. Returns the exit code.
pub fn run_batch(args: &RunArgs, cancel: &CancelToken) -> Result<i32> {
    let base = load_config(&args.config)?;
    let overrides = Overrides {
        model: args.model.clone(),
        max_steps: args.max_steps,
        workers: args.workers,
        sandbox: args.sandbox,
        output_dir: args.output.clone(),
    };
    let config = apply_overrides(base, &overrides)?;

    let filter = args
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --filter regex")?;
    let slice = args
        .slice
        .as_deref()
        .map(Slice::parse)
        .transpose()?
        .unwrap_or_default();
    let instances = select(load_instances(&args.instances)?, filter.as_ref(), slice);
    if instances.is_empty() {
        bail!("no instances selected from {}", args.instances.display());
    }
    debug!(selected = instances.len(), "instances loaded");

    let output_dir = config.orchestrator.output_dir.clone();
    let backend = LiveBackend::new(&config);
    let request = RunRequest {
        instances_path: &args.instances,
        output_dir: &output_dir,
        config: &config,
        backend: &backend,
        cancel,
    };
    let meta = run_all(&request, instances)?;

    println!(
        "run: scheduled={} completed={} skipped={} errors={} output={}",
        meta.scheduled,
        meta.completed,
        meta.skipped,
        meta.errors,
        output_dir.display()
    );
    for (status, count) in &meta.exit_statuses {
        println!("run: status {status}={count}");
    }

    if meta.interrupted {
        return Ok(exit_codes::INTERRUPTED);
    }
    if args.run_evaluation {
        evaluate(args, &output_dir);
    }
    if meta.all_submitted() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::PARTIAL)
    }
}

/// Run the harness; failures are printed with the manual command, not raised.
fn evaluate(args: &RunArgs, output_dir: &Path) {
    let run_id = output_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "batch".to_string());
    let request = EvaluationRequest {
        python: args.python.clone(),
        dataset_name: args.dataset_name.clone(),
        predictions_path: PredictionsStore::in_dir(output_dir).path().to_path_buf(),
        max_workers: args.eval_max_workers,
        run_id,
    };
    let log_path = output_dir.join(HARNESS_LOG_FILE);
    match run_evaluation(&request, &log_path) {
        Ok(status) if status.success() => {
            info!(log = %log_path.display(), "evaluation finished");
            println!("evaluation: ok log={}", log_path.display());
        }
        Ok(status) => {
            eprintln!(
                "evaluation failed ({status}); see {}\nrun manually: {}",
                log_path.display(),
                request.command_line()
            );
        }
        Err(err) => {
            eprintln!(
                "evaluation failed: {err:#}\nrun manually: {}",
                request.command_line()
            );
        }
    }
}

/// Show aggregated results for an output directory.
pub fn report_output(output_dir: &Path) -> Result<()> {
    let (summary, warnings) = aggregate(output_dir)?;
    println!(
        "report: instances={} predictions={} patched={}",
        summary.instances, summary.predictions, summary.patched
    );
    for (status, count) in &summary.exit_statuses {
        println!("report: status {status}={count}");
    }
    if let Some(avg) = summary.avg_steps {
        println!("report: avg_steps={avg:.2}");
    }
    if let Some(avg) = summary.avg_duration_secs {
        println!("report: avg_duration_secs={avg:.2}");
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
