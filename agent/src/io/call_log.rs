//! Append-only JSONL log of every model call made for one instance.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::core::types::Turn;

pub const CALL_LOG_FILE: &str = "llm_calls.jsonl";

#[derive(Debug, Serialize)]
struct CallRecord<'a> {
    call_number: u64,
    timestamp: String,
    model: &'a str,
    success: bool,
    messages: &'a [Turn],
    response: Option<&'a str>,
    error: Option<&'a str>,
}

/// Per-instance call log.
///
/// The counter resumes after the records already in the file, so call
/// numbers stay monotonic across re-runs of the same instance.
#[derive(Debug)]
pub struct CallLog {
    path: PathBuf,
    file: File,
    next_call: u64,
}

impl CallLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let existing = count_lines(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open call log {}", path.display()))?;
        Ok(Self {
            path,
            file,
            next_call: existing + 1,
        })
    }

    /// Open `llm_calls.jsonl` inside an instance directory.
    pub fn in_dir(instance_dir: &Path) -> Result<Self> {
        Self::open(instance_dir.join(CALL_LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Returns the call number it was logged under.
    pub fn record(
        &mut self,
        model: &str,
        messages: &[Turn],
        outcome: Result<&str, &str>,
    ) -> Result<u64> {
        let call_number = self.next_call;
        let record = CallRecord {
            call_number,
            timestamp: Utc::now().to_rfc3339(),
            model,
            success: outcome.is_ok(),
            messages,
            response: outcome.ok(),
            error: outcome.err(),
        };
        let mut line = serde_json::to_string(&record).context("serialize call record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append call log {}", self.path.display()))?;
        self.file.flush().context("flush call log")?;
        self.next_call += 1;
        Ok(call_number)
    }

    /// Like [`CallLog::record`], but a failed write only warns.
    pub fn record_best_effort(&mut self, model: &str, messages: &[Turn], outcome: Result<&str, &str>) {
        if let Err(err) = self.record(model, messages, outcome) {
            warn!(path = %self.path.display(), err = %err, "failed to write call log");
        }
    }
}

fn count_lines(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn read_records(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn records_success_and_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut log = CallLog::in_dir(&temp.path().join("inst-1")).expect("open");
        let messages = vec![Turn::system("sys"), Turn::user("task")];

        assert_eq!(log.record("m", &messages, Ok("answer")).expect("record"), 1);
        assert_eq!(log.record("m", &messages, Err("quota")).expect("record"), 2);

        let records = read_records(log.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["call_number"], 1);
        assert_eq!(records[0]["success"], true);
        assert_eq!(records[0]["response"], "answer");
        assert_eq!(records[0]["messages"][1]["role"], "user");
        assert_eq!(records[1]["success"], false);
        assert_eq!(records[1]["error"], "quota");
        assert!(records[1]["response"].is_null());
    }

    #[test]
    fn counter_continues_after_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let mut log = CallLog::in_dir(temp.path()).expect("open");
            log.record("m", &[], Ok("a")).expect("record");
            log.record("m", &[], Ok("b")).expect("record");
        }
        let mut log = CallLog::in_dir(temp.path()).expect("reopen");
        assert_eq!(log.record("m", &[], Ok("c")).expect("record"), 3);
        assert_eq!(read_records(log.path()).len(), 3);
    }
}
