//! Per-instance trajectory file, written once when the instance completes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{StepRecord, Turn};
use crate::io::write_json;

/// Full record of one instance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub instance_id: String,
    pub model_name: String,
    /// Termination label, or `error` when the run never reached the loop.
    pub exit_status: String,
    /// Patch text (possibly empty).
    pub result: String,
    pub steps: Vec<StepRecord>,
    pub messages: Vec<Turn>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `<output_dir>/<id>/<id>.traj.json`
pub fn trajectory_path(output_dir: &Path, instance_id: &str) -> PathBuf {
    output_dir
        .join(instance_id)
        .join(format!("{instance_id}.traj.json"))
}

pub fn write_trajectory(path: &Path, trajectory: &Trajectory) -> Result<()> {
    write_json(path, trajectory)
}

pub fn read_trajectory(path: &Path) -> Result<Trajectory> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Delete a stale trajectory. Missing files are fine.
pub fn remove_trajectory(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Trajectory {
        let now = Utc::now();
        Trajectory {
            instance_id: "a__b-1".to_string(),
            model_name: "scripted".to_string(),
            exit_status: "submitted".to_string(),
            result: "diff --git a/x b/x\n".to_string(),
            steps: Vec::new(),
            messages: vec![Turn::system("sys")],
            started_at: now,
            finished_at: now,
            error: None,
        }
    }

    #[test]
    fn writes_under_instance_dir_and_reads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = trajectory_path(temp.path(), "a__b-1");
        assert!(path.ends_with("a__b-1/a__b-1.traj.json"));

        let trajectory = sample();
        write_trajectory(&path, &trajectory).expect("write");
        assert_eq!(read_trajectory(&path).expect("read"), trajectory);
    }

    #[test]
    fn removing_missing_trajectory_is_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = trajectory_path(temp.path(), "gone");
        remove_trajectory(&path).expect("remove missing");

        write_trajectory(&path, &sample()).expect("write");
        remove_trajectory(&path).expect("remove");
        assert!(!path.exists());
    }
}
