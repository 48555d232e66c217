use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use agent::io::trajectory::{read_trajectory, trajectory_path};
use anyhow::{Context, Result};

use crate::predictions::PredictionsStore;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub instances: usize,
    pub exit_statuses: BTreeMap<String, usize>,
    /// Predictions with a non-empty patch.
    pub patched: usize,
    pub predictions: usize,
    pub avg_steps: Option<f64>,
    pub avg_duration_secs: Option<f64>,
}

pub fn load_instance_dirs(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(output_dir).with_context(|| format!("read {}", output_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Summarize trajectories and predictions under `output_dir`.
///
/// Unreadable trajectories and mismatches between the two are reported as
/// warnings rather than errors.
pub fn aggregate(output_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut seen = Vec::new();

    for dir in load_instance_dirs(output_dir)? {
        let Some(id) = dir.file_name().map(|name| name.to_string_lossy().to_string()) else {
            continue;
        };
        let path = trajectory_path(output_dir, &id);
        if !path.exists() {
            continue;
        }
        let trajectory = match read_trajectory(&path) {
            Ok(trajectory) => trajectory,
            Err(err) => {
                warnings.push(format!("skip {}: trajectory invalid ({err:#})", dir.display()));
                continue;
            }
        };

        summary.instances += 1;
        *summary
            .exit_statuses
            .entry(trajectory.exit_status.clone())
            .or_insert(0) += 1;
        let steps = trajectory.steps.len() as f64;
        let duration = (trajectory.finished_at - trajectory.started_at).num_milliseconds() as f64
            / 1000.0;
        summary.avg_steps = Some(running_mean(summary.avg_steps, steps, summary.instances));
        summary.avg_duration_secs = Some(running_mean(
            summary.avg_duration_secs,
            duration,
            summary.instances,
        ));
        seen.push(id);
    }

    let table = PredictionsStore::in_dir(output_dir).load()?;
    summary.predictions = table.len();
    summary.patched = table
        .values()
        .filter(|prediction| !prediction.model_patch.trim().is_empty())
        .count();
    for id in &seen {
        if !table.contains_key(id) {
            warnings.push(format!("{id}: trajectory without prediction"));
        }
    }
    for id in table.keys() {
        if !seen.contains(id) {
            warnings.push(format!("{id}: prediction without trajectory"));
        }
    }

    Ok((summary, warnings))
}

fn running_mean(current: Option<f64>, value: f64, count: usize) -> f64 {
    match current {
        None => value,
        Some(avg) => (avg * (count as f64 - 1.0) + value) / count as f64,
    }
}
