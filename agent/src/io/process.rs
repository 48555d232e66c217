//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{mem, thread};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for commands killed at their timeout (matches `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, with timeouts and signal deaths mapped to stable values.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&truncated_notice("stdout", self.stdout_truncated));
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&truncated_notice("stderr", self.stderr_truncated));
        text
    }
}

fn truncated_notice(label: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Time the readers get to drain the pipes once the child has exited.
///
/// Descendants that outlive the child keep the pipes open; after this grace they are killed
/// along with the rest of the process group.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group, so a timeout kills every descendant and not
/// just the direct child. The call never waits on the pipes for longer than the drain grace
/// after the child is gone.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let mut stdout_reader = StreamReader::spawn(stdout, output_limit_bytes);
    let mut stderr_reader = StreamReader::spawn(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        // Dropping the handle at the end of this block closes the pipe.
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(err) = child_stdin.write_all(input) {
            // The child may exit without reading its input.
            debug!(err = %err, "write stdin");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_tree(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let deadline = Instant::now() + DRAIN_GRACE;
    if !(stdout_reader.wait_until(deadline) && stderr_reader.wait_until(deadline)) {
        warn!("output pipes still open after exit, killing process group");
        kill_group(child.id());
        let deadline = Instant::now() + DRAIN_GRACE;
        stdout_reader.wait_until(deadline);
        stderr_reader.wait_until(deadline);
    }

    let (stdout, stdout_truncated) = stdout_reader.finish().context("read stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.finish().context("read stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    // Covers platforms without process groups and a child that already left its group.
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill command");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // ESRCH once every member has exited.
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(err = %err, pid, "kill process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[derive(Default)]
struct Captured {
    buf: Vec<u8>,
    truncated: usize,
}

/// Reads one pipe on a background thread into a buffer the caller can take at any time.
///
/// A reader left blocked on a pipe held open by a stray descendant is detached rather than
/// joined; whatever it captured so far is still returned.
struct StreamReader {
    captured: Arc<Mutex<Captured>>,
    done: mpsc::Receiver<Result<()>>,
    outcome: Option<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            // The receiver is gone only if the caller already gave up on this stream.
            let _ = tx.send(read_stream_limited(reader, limit, &sink));
        });
        Self {
            captured,
            done,
            outcome: None,
        }
    }

    /// Wait for end of stream until `deadline`. Returns whether the stream was drained.
    fn wait_until(&mut self, deadline: Instant) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let outcome = match self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => return false,
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
        };
        self.outcome = Some(outcome);
        true
    }

    fn finish(self) -> Result<(Vec<u8>, usize)> {
        match self.outcome {
            Some(result) => result?,
            None => warn!("output reader still blocked, returning partial output"),
        }
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((mem::take(&mut captured.buf), captured.truncated))
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &Mutex<Captured>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.buf.len());
        let keep = n.min(remaining);
        captured.buf.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo hello; echo oops >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1_000,
        )
        .expect("run");
        assert_eq!(output.exit_code(), 3);
        assert_eq!(output.stdout_text(), "hello\n");
        assert_eq!(output.stderr_text(), "oops\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_command_at_timeout() {
        let output = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(200),
            1_000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code(), TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("bash -c 'sleep 4; echo late'"),
            None,
            Duration::from_millis(300),
            1_000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(!output.stdout_text().contains("late"));
    }

    #[test]
    fn background_job_does_not_hold_the_call_open() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 8 & echo started"),
            None,
            Duration::from_secs(20),
            1_000,
        )
        .expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.exit_code(), 0);
        assert_eq!(output.stdout_text(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(6), "{:?}", started.elapsed());
    }

    #[test]
    fn feeds_stdin() {
        let output = run_command_with_timeout(
            Command::new("cat"),
            Some(b"piped input"),
            Duration::from_secs(10),
            1_000,
        )
        .expect("run");
        assert_eq!(output.stdout_text(), "piped input");
    }
}
