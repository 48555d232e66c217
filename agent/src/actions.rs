//! Actions backed by a [`Sandbox`], registered for every instance run.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::error::EnvironmentError;
use crate::io::sandbox::Sandbox;
use crate::registry::{ActionSpec, Arguments, FunctionRegistry};

pub const RUN_BASH_CMD: &str = "run_bash_cmd";
pub const SHOW_FILE: &str = "show_file";
pub const REPLACE_IN_FILE: &str = "replace_in_file";
pub const FINISH: &str = "finish";

/// Register the standard action set against `sandbox`.
pub fn register_sandbox_actions<'a>(
    registry: &mut FunctionRegistry<'a>,
    sandbox: &'a dyn Sandbox,
    command_timeout: Duration,
) -> Result<()> {
    registry.register(
        ActionSpec::new(
            RUN_BASH_CMD,
            "Run a bash command in the repository root and return its output. \
             Non-zero exit codes are reported after the output.",
        )
        .param("command", "The bash command to run"),
        move |args| run_bash_cmd(sandbox, args, command_timeout),
    )?;
    registry.register(
        ActionSpec::new(
            SHOW_FILE,
            "Show a file with line numbers, optionally limited to a line range.",
        )
        .param("file_path", "Path relative to the repository root")
        .optional("start_line", "First line to show (1-based, inclusive)")
        .optional("end_line", "Last line to show (1-based, inclusive)"),
        move |args| show_file(sandbox, args),
    )?;
    registry.register(
        ActionSpec::new(
            REPLACE_IN_FILE,
            "Replace exactly one occurrence of old_text with new_text in a file. \
             Fails if old_text is missing or appears more than once.",
        )
        .param("file_path", "Path relative to the repository root")
        .param("old_text", "Existing text to replace, including enough context to be unique")
        .param("new_text", "Replacement text"),
        move |args| replace_in_file(sandbox, args),
    )?;
    registry.register(
        ActionSpec::new(FINISH, "Submit your work and stop.")
            .param("result", "Short summary of the fix")
            .terminal(),
        |args| Ok(args["result"].clone()),
    )?;
    Ok(())
}

fn run_bash_cmd(sandbox: &dyn Sandbox, args: &Arguments, timeout: Duration) -> Result<String> {
    let result = sandbox.run_command(&args["command"], timeout)?;
    if result.timed_out {
        let error = EnvironmentError::Timeout {
            timeout_secs: timeout.as_secs(),
        };
        let partial = result.render();
        if partial.is_empty() {
            return Err(anyhow!(error));
        }
        bail!("{error}\n{partial}");
    }
    let rendered = result.render();
    if rendered.is_empty() {
        return Ok("(no output)".to_string());
    }
    Ok(rendered)
}

fn show_file(sandbox: &dyn Sandbox, args: &Arguments) -> Result<String> {
    let path = &args["file_path"];
    let contents = sandbox.read_file(path)?;
    let start = parse_line_arg(args, "start_line")?.unwrap_or(1);
    let end = parse_line_arg(args, "end_line")?;
    if let Some(end) = end.filter(|end| *end < start) {
        bail!("end_line {end} is before start_line {start}");
    }

    let total = contents.lines().count();
    if total == 0 {
        return Ok(format!("{path} is empty"));
    }
    if start > total {
        bail!("start_line {start} is past the end of {path} ({total} lines)");
    }
    let end = end.unwrap_or(total).min(total);
    let numbered: Vec<String> = contents
        .lines()
        .enumerate()
        .skip(start - 1)
        .take(end + 1 - start)
        .map(|(idx, line)| format!("{:>6}\t{line}", idx + 1))
        .collect();
    Ok(numbered.join("\n"))
}

fn replace_in_file(sandbox: &dyn Sandbox, args: &Arguments) -> Result<String> {
    let path = &args["file_path"];
    let old_text = &args["old_text"];
    let new_text = &args["new_text"];
    if old_text.is_empty() {
        bail!("old_text must be non-empty");
    }
    let contents = sandbox.read_file(path)?;
    match contents.matches(old_text.as_str()).count() {
        0 => bail!("old_text not found in {path}"),
        1 => {}
        n => bail!("old_text matches {n} times in {path}; include more surrounding context"),
    }
    let updated = contents.replacen(old_text.as_str(), new_text, 1);
    sandbox.write_file(path, &updated)?;
    Ok(format!("Replaced 1 occurrence in {path}"))
}

fn parse_line_arg(args: &Arguments, name: &str) -> Result<Option<usize>> {
    let Some(raw) = args.get(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let value: usize = raw
        .parse()
        .with_context(|| format!("{name} must be a positive integer, got '{raw}'"))?;
    if value == 0 {
        bail!("{name} must be >= 1");
    }
    Ok(Some(value))
}
