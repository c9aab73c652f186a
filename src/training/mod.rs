//! Training infrastructure for plankton classifiers
//!
//! This module provides data loading, the epoch training loop, optimization,
//! learning rate control, early stopping, checkpointing and metrics for
//! fine-tuning image classifiers on plankton imagery.
//!
//! # Main Components
//!
//! - **Configuration**: serde training configuration with layered loading
//! - **Data**: sample sets, augmentation transforms and a prefetching loader
//! - **Trainer**: the epoch state machine producing the best checkpoint
//! - **Steps**: single-epoch train/validate/predict passes
//! - **Optimizers**: AdamW, gradient clipping, warmup/cosine and plateau decay
//! - **Checkpoints**: best-model persistence with a JSON sidecar
//! - **Metrics**: accuracy, macro F1 and the per-epoch history
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use plankton::training::{Trainer, TrainingConfig};
//! use candle_core::Device;
//!
//! let config = TrainingConfig::load_layered(Some(Path::new("train.yaml")))?;
//! let mut trainer = Trainer::new(config, "./out/", "Init_0", Device::Cpu)?;
//! let result = trainer.run_from_folder(Path::new("./data/"))?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod steps;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    DataConfig, EarlyStoppingConfig, OptimizerConfig, SavedParams, ScheduleConfig, TrainingConfig,
    TrainingParams,
};

// Trainer re-exports
pub use trainer::{TestSummary, Trainer, TrainingEvent, TrainingResult, TrainingState, TrainingStatus};

// Data re-exports
pub use data::{AugmentedDataset, DataLoader, DataLoaderConfig, DataSplits, EvalDataset, SampleSet};

// Component re-exports
pub use checkpoints::{CheckpointManager, CheckpointMetadata};
pub use early_stopping::EarlyStopping;
pub use loss::{class_weights, CrossEntropyLoss};
pub use metrics::{accuracy, accuracy_score, f1_macro, EpochMetrics, MetricHistory};
pub use optimizers::{adjust_learning_rate, AdamWOptimizer, LrScheduler, Optimizer};
pub use steps::{predict_epoch, train_epoch, validate_epoch, EpochOutput, PredictOutput};
