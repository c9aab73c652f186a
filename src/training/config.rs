//! Training configuration for plankton classifiers
//!
//! Hyperparameters are grouped by concern. A config can be read directly from
//! a JSON/YAML file or layered (defaults, then file, then `PLANKTON__*`
//! environment variables) through the `config` crate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{ModelArchitecture, ModelConfig};

/// Environment prefix for layered configuration
pub const ENV_PREFIX: &str = "PLANKTON";

/// Main training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Model configuration
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Learning-rate schedule configuration
    pub schedule: ScheduleConfig,

    /// Early stopping configuration
    pub early_stopping: EarlyStoppingConfig,

    /// Epoch/batch parameters
    pub training: TrainingParams,

    /// Split configuration
    pub data: DataConfig,
}

/// AdamW settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// Decoupled weight decay coefficient
    pub weight_decay: f64,

    /// Beta1 parameter
    pub beta1: f64,

    /// Beta2 parameter
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,

    /// Global L2 gradient-norm threshold, disabled when `<= 0`
    pub clip_grad_norm: f64,
}

/// Warmup/cosine and plateau settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Number of warmup epochs
    pub warmup: usize,

    /// Disable the cosine decay after warmup
    pub disable_cos: bool,

    /// Plateau decay factor
    pub plateau_factor: f64,

    /// Epochs without improvement before the plateau decay fires
    pub plateau_patience: usize,

    /// Learning-rate floor for the plateau decay
    pub plateau_min_lr: f64,

    /// Relative improvement threshold for the plateau decay
    pub plateau_threshold: f64,
}

/// Early stopping settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before stopping
    pub patience: usize,

    /// Minimum loss decrease counted as an improvement
    pub min_delta: f64,
}

/// Core training loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of epochs
    pub epochs: usize,

    /// Batch size for all loaders
    pub batch_size: usize,

    /// Worker threads per data loader
    pub num_workers: usize,

    /// Batches prefetched ahead of the training thread
    pub prefetch_factor: usize,

    /// Random seed for splits, shuffling and augmentation
    pub seed: u64,

    /// Weight the loss by balanced class weights
    pub class_weighting: bool,

    /// Evaluate the best checkpoint on the test split after training
    pub evaluate_test_split: bool,
}

/// Data split configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Fraction of each class held out for validation
    pub val_fraction: f64,

    /// Fraction of each class held out for testing
    pub test_fraction: f64,
}

impl TrainingConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {:?}", path))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .context("Failed to assemble layered config")?
            .try_deserialize()
            .context("Failed to deserialize layered config")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.training.epochs == 0 {
            anyhow::bail!("epochs must be greater than 0");
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.optimizer.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive");
        }
        if self.optimizer.weight_decay < 0.0 {
            anyhow::bail!("weight_decay must be non-negative");
        }
        if !(0.0..1.0).contains(&self.optimizer.beta1) || !(0.0..1.0).contains(&self.optimizer.beta2) {
            anyhow::bail!("beta1 and beta2 must lie in [0, 1)");
        }
        // The cosine term divides by (epochs - warmup).
        if !self.schedule.disable_cos && self.schedule.warmup >= self.training.epochs {
            anyhow::bail!(
                "warmup ({}) must be smaller than epochs ({}) when cosine decay is enabled",
                self.schedule.warmup,
                self.training.epochs
            );
        }
        if !(0.0..1.0).contains(&self.schedule.plateau_factor) || self.schedule.plateau_factor == 0.0 {
            anyhow::bail!("plateau_factor must lie in (0, 1)");
        }
        if self.early_stopping.min_delta < 0.0 {
            anyhow::bail!("early_stopping.min_delta must be non-negative");
        }

        let fractions = [self.data.val_fraction, self.data.test_fraction];
        if fractions.iter().any(|f| !(0.0..1.0).contains(f)) {
            anyhow::bail!("val_fraction and test_fraction must lie in [0, 1)");
        }
        if self.data.val_fraction + self.data.test_fraction >= 1.0 {
            anyhow::bail!("val_fraction + test_fraction must leave samples for training");
        }

        self.model.validate()?;
        Ok(())
    }

    /// Checkpoint directory for a named run under `output_dir`
    pub fn checkpoint_dir(output_dir: &Path, run_name: &str) -> PathBuf {
        output_dir.join(run_name).join("trained_models")
    }

    /// Small configuration for smoke tests and CPU experiments
    pub fn tiny() -> Self {
        let mut config = Self::default();
        config.model = ModelConfig {
            architecture: ModelArchitecture::Linear,
            image_size: 16,
            pretrained: None,
        };
        config.training.epochs = 3;
        config.training.batch_size = 4;
        config.training.num_workers = 1;
        config.schedule.warmup = 1;
        config
    }
}

/// File name of the parameters persisted by a training run
pub const PARAMS_FILE: &str = "params.json";

/// Parameters a training run leaves in its output directory for prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedParams {
    pub config: TrainingConfig,
    /// Class names indexed by label
    pub classes: Vec<String>,
}

impl SavedParams {
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(PARAMS_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path)
    }

    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(PARAMS_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read training parameters: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
            training: TrainingParams::default(),
            data: DataConfig::default(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 0.03,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            clip_grad_norm: 0.0,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup: 3,
            disable_cos: false,
            plateau_factor: 0.5,
            plateau_patience: 4,
            plateau_min_lr: 1e-10,
            plateau_threshold: 1e-4,
        }
    }
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 5,
            min_delta: 0.0,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 60,
            batch_size: 32,
            num_workers: 4,
            prefetch_factor: 2,
            seed: 42,
            class_weighting: true,
            evaluate_test_split: true,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            val_fraction: 0.2,
            test_fraction: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule.plateau_factor, 0.5);
        assert_eq!(config.schedule.plateau_patience, 4);
        assert_eq!(config.schedule.plateau_min_lr, 1e-10);
        assert_eq!(config.early_stopping.patience, 5);
        assert_eq!(config.training.num_workers, 4);
    }

    #[test]
    fn test_config_serialization() {
        let config = TrainingConfig::tiny();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();

        for name in ["params.json", "params.yaml"] {
            let path = temp_dir.path().join(name);
            let config = TrainingConfig::tiny();
            config.to_file(&path).unwrap();

            let loaded = TrainingConfig::from_file(&path).unwrap();
            assert_eq!(loaded, config);
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "training": { "epochs": 7 } }"#).unwrap();

        let config = TrainingConfig::from_file(&path).unwrap();
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_layered_config_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("layered.json");
        std::fs::write(&path, r#"{ "training": { "epochs": 12, "batch_size": 8 } }"#).unwrap();

        let config = TrainingConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(config.training.epochs, 12);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainingConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.schedule.warmup = config.training.epochs;
        assert!(config.validate().is_err());

        config.schedule.disable_cos = true;
        assert!(config.validate().is_ok());

        let mut config = TrainingConfig::default();
        config.data.val_fraction = 0.6;
        config.data.test_fraction = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_dir_layout() {
        let dir = TrainingConfig::checkpoint_dir(Path::new("out"), "Init_0");
        assert_eq!(dir, PathBuf::from("out/Init_0/trained_models"));
    }

    #[test]
    fn test_saved_params_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let params = SavedParams {
            config: TrainingConfig::tiny(),
            classes: vec!["copepod".to_string(), "diatom".to_string()],
        };
        let path = params.save(temp_dir.path()).unwrap();
        assert_eq!(path, temp_dir.path().join(PARAMS_FILE));
        assert_eq!(SavedParams::load(temp_dir.path()).unwrap(), params);
    }
}
