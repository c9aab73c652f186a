//! Image classifiers fine-tuned by the trainer
//!
//! Models are built on a [`VarMap`] so that the optimizer, the checkpoint
//! manager and the pretrained-weight loader all see the same named variables.

pub mod linear;
pub mod vit;

pub use linear::LinearClassifier;
pub use vit::{VitClassifier, VitConfig};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A classifier mapping a `(batch, 3, H, W)` image tensor to `(batch, classes)` logits
pub trait ImageClassifier: Send + Sync {
    /// Forward pass; `train` selects training-mode behaviour where a model has any
    fn forward(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    /// Number of output classes
    fn num_classes(&self) -> usize;

    /// Short architecture name for logs
    fn name(&self) -> &str;
}

/// Supported architectures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelArchitecture {
    /// Vision transformer with a classification head on the CLS token
    Vit(VitConfig),
    /// Flatten + single linear layer, a baseline for quick CPU runs
    Linear,
}

/// Where pretrained weights come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PretrainedSource {
    /// A local safetensors file
    Local { path: PathBuf },
    /// A file in a Hugging Face hub model repository
    Hub { repo: String, file: String },
}

/// Model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Architecture and its hyperparameters
    pub architecture: ModelArchitecture,

    /// Square input resolution fed to the model
    pub image_size: usize,

    /// Pretrained weights to start from
    pub pretrained: Option<PretrainedSource>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: ModelArchitecture::Vit(VitConfig::deit_base_patch16()),
            image_size: 224,
            pretrained: Some(PretrainedSource::Hub {
                repo: "facebook/deit-base-patch16-224".to_string(),
                file: "model.safetensors".to_string(),
            }),
        }
    }
}

impl ModelConfig {
    /// Check that the architecture can consume `image_size` inputs
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(Error::config("image_size must be greater than 0"));
        }
        if let ModelArchitecture::Vit(vit) = &self.architecture {
            vit.validate(self.image_size)?;
        }
        Ok(())
    }

    /// Build the classifier on a fresh variable map
    pub fn build(&self, num_classes: usize, device: &Device) -> Result<(VarMap, Box<dyn ImageClassifier>)> {
        if num_classes == 0 {
            return Err(Error::model("cannot build a classifier with zero classes"));
        }
        self.validate()?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let model: Box<dyn ImageClassifier> = match &self.architecture {
            ModelArchitecture::Vit(vit) => {
                Box::new(VitClassifier::new(vit, self.image_size, num_classes, vb)?)
            }
            ModelArchitecture::Linear => {
                Box::new(LinearClassifier::new(self.image_size, num_classes, vb)?)
            }
        };

        debug!("Built {} classifier with {} classes", model.name(), num_classes);
        Ok((var_map, model))
    }

    /// Resolve the pretrained source to a local file, downloading from the hub if needed
    pub fn resolve_pretrained(&self) -> Result<Option<PathBuf>> {
        match &self.pretrained {
            None => Ok(None),
            Some(PretrainedSource::Local { path }) => Ok(Some(path.clone())),
            Some(PretrainedSource::Hub { repo, file }) => {
                info!("Fetching pretrained weights {}/{}", repo, file);
                let api = hf_hub::api::sync::Api::new()
                    .map_err(|e| Error::model(format!("hub client: {}", e)))?;
                let path = api
                    .model(repo.clone())
                    .get(file)
                    .map_err(|e| Error::model(format!("download {}/{}: {}", repo, file, e)))?;
                Ok(Some(path))
            }
        }
    }
}

/// Outcome of copying pretrained tensors into a variable map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PretrainedReport {
    /// Variables overwritten from the file
    pub loaded: Vec<String>,
    /// Variables left at their fresh initialization (missing or shape mismatch)
    pub skipped: Vec<String>,
}

/// Copy tensors from a safetensors file into `var_map`, matching by name and shape
///
/// A classifier head whose class count differs from the pretrained one keeps
/// its fresh initialization.
pub fn load_pretrained(var_map: &VarMap, path: &Path, device: &Device) -> Result<PretrainedReport> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let report = copy_matching(var_map, &tensors, "")?;

    info!(
        "Loaded {} pretrained tensors from {:?} ({} kept fresh)",
        report.loaded.len(),
        path,
        report.skipped.len()
    );
    for name in &report.skipped {
        debug!("Kept fresh initialization for {}", name);
    }
    Ok(report)
}

/// Copy `tensors[prefix + name]` into every variable whose name and shape match
pub(crate) fn copy_matching(
    var_map: &VarMap,
    tensors: &HashMap<String, Tensor>,
    prefix: &str,
) -> Result<PretrainedReport> {
    let vars = var_map
        .data()
        .lock()
        .map_err(|_| Error::model("variable map lock poisoned"))?;

    let mut report = PretrainedReport::default();
    for (name, var) in vars.iter() {
        match tensors.get(&format!("{}{}", prefix, name)) {
            Some(tensor) if tensor.shape() == var.shape() => {
                var.set(&tensor.to_dtype(var.dtype())?)?;
                report.loaded.push(name.clone());
            }
            Some(tensor) => {
                warn!(
                    "Shape mismatch for {}: expected {:?}, found {:?}",
                    name,
                    var.shape(),
                    tensor.shape()
                );
                report.skipped.push(name.clone());
            }
            None => report.skipped.push(name.clone()),
        }
    }
    report.loaded.sort();
    report.skipped.sort();
    Ok(report)
}

/// Total number of scalar parameters held by a variable map
pub fn count_parameters(var_map: &VarMap) -> usize {
    var_map.all_vars().iter().map(|v| v.elem_count()).sum()
}
