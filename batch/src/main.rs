mod cli;
mod config;
mod harness;
mod instance;
mod pool;
mod predictions;
mod report;
mod run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent::cancel::CancelToken;
use agent::exit_codes;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "batch",
    version,
    about = "Run the repair agent over a set of task instances"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process instances and write trajectories plus `preds.json`.
    Run(cli::RunArgs),
    /// Summarize an output directory.
    Report { output: PathBuf },
}

fn main() {
    agent::logging::init("info");
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
        Command::Run(args) => {
            let cancel = CancelToken::new();
            install_interrupt_handler(cancel.clone())?;
            cli::run_batch(&args, &cancel)
        }
        Command::Report { output } => {
            cli::report_output(&output)?;
            Ok(exit_codes::OK)
        }
    }
}

/// First Ctrl-C stops scheduling new instances; the second exits at once.
fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("interrupt: finishing running instances (press again to exit)");
            cancel.cancel();
        } else {
            eprintln!("interrupt: exiting");
            std::process::exit(exit_codes::INTERRUPTED);
        }
    })
    .context("install interrupt handler")
}
