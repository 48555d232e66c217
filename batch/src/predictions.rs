//! Shared predictions file consumed by the evaluation harness.
//!
//! The file maps instance id to `{instance_id, model_name_or_path,
//! model_patch}`. Every read-modify-write goes through one lock, and the file
//! is replaced atomically, so concurrent workers never lose each other's
//! entries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use agent::io::write_json;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const PREDICTIONS_FILE: &str = "preds.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    #[serde(alias = "model_name")]
    pub model_name_or_path: String,
    pub model_patch: String,
}

pub type PredictionTable = BTreeMap<String, Prediction>;

#[derive(Debug)]
pub struct PredictionsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PredictionsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(PREDICTIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current table; empty when the file does not exist yet.
    pub fn load(&self) -> Result<PredictionTable> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_table(&self.path)
    }

    /// Insert or replace the entry for `prediction.instance_id`.
    pub fn upsert(&self, prediction: Prediction) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = read_table(&self.path)?;
        debug!(
            instance_id = %prediction.instance_id,
            patch_bytes = prediction.model_patch.len(),
            "upsert prediction"
        );
        table.insert(prediction.instance_id.clone(), prediction);
        write_json(&self.path, &table)
    }

    /// Drop a stale entry. Returns whether one existed.
    pub fn remove(&self, instance_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = read_table(&self.path)?;
        if table.remove(instance_id).is_none() {
            return Ok(false);
        }
        write_json(&self.path, &table)?;
        Ok(true)
    }
}

fn read_table(path: &Path) -> Result<PredictionTable> {
    if !path.exists() {
        return Ok(PredictionTable::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(PredictionTable::new());
    }
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
