//! Single-repository front end for the repair agent.
//!
//! `agent solve` runs one problem statement against one repository and prints
//! the resulting patch on stdout. Batch runs over many instances live in the
//! `batch` binary.

use std::fs;
use std::path::{Path, PathBuf};

use agent::actions::register_sandbox_actions;
use agent::cancel::CancelToken;
use agent::controller::Agent;
use agent::core::protocol::CallCodec;
use agent::core::types::Termination;
use agent::exit_codes;
use agent::io::call_log::CallLog;
use agent::io::config::{AgentConfig, SandboxKind, load_config, write_config};
use agent::io::prompt::PromptEngine;
use agent::io::sandbox::{SandboxTarget, open_sandbox};
use agent::io::transport::OpenAiModel;
use agent::registry::FunctionRegistry;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Bounded ReAct agent for automated software repair"
)]
struct Cli {
    /// Path to the TOML config (defaults apply when missing).
    #[arg(long, default_value = "agent.toml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Repair one repository and print the patch.
    Solve {
        /// Local path, git URL, or GitHub `owner/name`.
        #[arg(long)]
        repo: String,
        /// Commit to start from (default: the repository's default branch).
        #[arg(long, default_value = "")]
        commit: String,
        /// File containing the problem statement.
        #[arg(long)]
        problem: PathBuf,
        #[arg(long, value_enum)]
        sandbox: Option<SandboxKind>,
        #[arg(long)]
        max_steps: Option<u32>,
        /// Directory for `llm_calls.jsonl`.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Write the config file with every default spelled out.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    agent::logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Solve {
            repo,
            commit,
            problem,
            sandbox,
            max_steps,
            log_dir,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(kind) = sandbox {
                config.sandbox.kind = kind;
            }
            if let Some(max_steps) = max_steps {
                config.agent.max_steps = max_steps;
            }
            config.validate()?;
            let problem = fs::read_to_string(&problem)
                .with_context(|| format!("read problem statement {}", problem.display()))?;
            let target = SandboxTarget {
                instance_id: "solve".to_string(),
                repo,
                base_commit: commit,
            };
            cmd_solve(&config, &target, &problem, log_dir.as_deref())
        }
        Command::InitConfig { force } => {
            if cli.config.exists() && !force {
                bail!("{} already exists (use --force)", cli.config.display());
            }
            write_config(&cli.config, &AgentConfig::default())?;
            println!("{}", cli.config.display());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_solve(
    config: &AgentConfig,
    target: &SandboxTarget,
    problem: &str,
    log_dir: Option<&Path>,
) -> Result<i32> {
    let codec = CallCodec::default();
    let mut model = OpenAiModel::new(&config.model, codec.stop_marker())?;
    if let Some(dir) = log_dir {
        model = model.with_call_log(CallLog::in_dir(dir)?);
    }
    let sandbox = open_sandbox(&config.sandbox, target)?;
    let workdir = sandbox.workdir();
    let task = PromptEngine::new().render_instance(problem, &workdir)?;

    let mut registry = FunctionRegistry::new();
    register_sandbox_actions(&mut registry, sandbox.as_ref(), config.sandbox.command_timeout())?;
    let outcome = Agent::new("swe-agent", codec, &mut model, registry)
        .with_workdir(workdir)
        .run(&task, &config.agent.limits(), &CancelToken::new())?;

    let patch = sandbox.generate_patch(&outcome.result)?;
    info!(
        termination = outcome.termination.label(),
        steps = outcome.steps,
        patch_bytes = patch.len(),
        "solve finished"
    );
    print!("{patch}");
    if outcome.termination == Termination::Submitted {
        Ok(exit_codes::OK)
    } else {
        eprintln!("run ended without submission: {}", outcome.termination.label());
        Ok(exit_codes::PARTIAL)
    }
}
