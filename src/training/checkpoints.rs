//! Best-model checkpointing
//!
//! A run keeps a single "best" checkpoint, overwritten whenever validation F1
//! improves. Model parameters and optimizer moments share one safetensors file
//! (`model.*` and `optimizer.*` tensors); a JSON sidecar records the epoch,
//! metrics, learning rate and class table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::optimizers::Optimizer;
use crate::error::{Error, Result};
use crate::model::copy_matching;

/// Checkpoint tensor file name
pub const CHECKPOINT_FILE: &str = "trained_model.safetensors";
/// Checkpoint sidecar file name
pub const METADATA_FILE: &str = "trained_model.json";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Sidecar metadata written next to the checkpoint tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch (0-based) the checkpoint was taken at
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    pub val_f1: f64,
    pub val_accuracy: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    /// Class names indexed by label
    pub classes: Vec<String>,
    pub architecture: String,
    pub timestamp: DateTime<Utc>,
    pub framework_version: String,
}

impl CheckpointMetadata {
    pub fn new(epoch: usize, classes: Vec<String>, architecture: impl Into<String>) -> Self {
        Self {
            epoch,
            global_step: 0,
            val_f1: 0.0,
            val_accuracy: 0.0,
            val_loss: 0.0,
            learning_rate: 0.0,
            classes,
            architecture: architecture.into(),
            timestamp: Utc::now(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Reads and writes the best checkpoint of one run directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Use `dir` for checkpoints, creating it if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Open an existing checkpoint directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manager = Self { dir };
        if !manager.exists() {
            return Err(Error::checkpoint(format!(
                "no checkpoint at {:?}",
                manager.checkpoint_path()
            )));
        }
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.checkpoint_path().is_file() && self.metadata_path().is_file()
    }

    /// Write model parameters, optimizer state and metadata, replacing any
    /// previous checkpoint
    #[instrument(skip(self, var_map, optimizer, metadata), fields(epoch = metadata.epoch))]
    pub fn save(
        &self,
        var_map: &VarMap,
        optimizer: Option<&dyn Optimizer>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let mut tensors: HashMap<String, Tensor> = var_map
            .data()
            .lock()
            .map_err(|_| Error::checkpoint("variable map lock poisoned"))?
            .iter()
            .map(|(name, var)| (format!("{}{}", MODEL_PREFIX, name), var.as_tensor().clone()))
            .collect();

        if let Some(optimizer) = optimizer {
            for (name, tensor) in optimizer.state_tensors() {
                tensors.insert(format!("{}{}", OPTIMIZER_PREFIX, name), tensor);
            }
        }

        // Atomic replace of the previous checkpoint
        let path = self.checkpoint_path();
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        std::fs::write(self.metadata_path(), serde_json::to_string_pretty(metadata)?)?;

        info!(
            "Saved checkpoint at epoch {} (val F1 {:.4}) to {:?}",
            metadata.epoch + 1,
            metadata.val_f1,
            path
        );
        debug!("Checkpoint holds {} tensors", tensors.len());
        Ok(path)
    }

    pub fn load_metadata(&self) -> Result<CheckpointMetadata> {
        let json = std::fs::read_to_string(self.metadata_path())?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Restore model parameters (and optimizer state, if given) from the checkpoint
    ///
    /// Every variable in `var_map` must be present with a matching shape.
    #[instrument(skip(self, var_map, optimizer, device))]
    pub fn load(
        &self,
        var_map: &VarMap,
        optimizer: Option<&mut dyn Optimizer>,
        device: &Device,
    ) -> Result<CheckpointMetadata> {
        let metadata = self.load_metadata()?;
        let tensors = candle_core::safetensors::load(self.checkpoint_path(), device)?;

        let report = copy_matching(var_map, &tensors, MODEL_PREFIX)?;
        if !report.skipped.is_empty() {
            return Err(Error::checkpoint(format!(
                "checkpoint does not match the model: {} variables missing or mis-shaped (first: {})",
                report.skipped.len(),
                report.skipped[0]
            )));
        }

        if let Some(optimizer) = optimizer {
            let state: HashMap<String, Tensor> = tensors
                .iter()
                .filter_map(|(name, tensor)| {
                    name.strip_prefix(OPTIMIZER_PREFIX)
                        .map(|stripped| (stripped.to_string(), tensor.clone()))
                })
                .collect();
            optimizer.load_state_tensors(&state, metadata.global_step)?;
            optimizer.set_learning_rate(metadata.learning_rate);
        }

        info!(
            "Loaded checkpoint from epoch {} ({} tensors)",
            metadata.epoch + 1,
            report.loaded.len()
        );
        Ok(metadata)
    }
}
