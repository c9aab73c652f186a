//! Plankton - plankton image classification with fine-tuned vision transformers
//!
//! This crate trains image classifiers on labelled plankton image folders and
//! predicts held-out imagery with an ensemble of independently trained models.
//!
//! # Modules
//!
//! - [`training`]: data pipeline, trainer, optimizers, checkpoints, metrics
//! - [`model`]: the classifier architectures and pretrained weight loading
//! - [`predict`]: ensemble prediction over unlabeled images
//! - [`config`]: command-line input parameters
//! - [`logging`]: tracing subscriber setup

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod predict;
pub mod training;
pub mod utils;

// Re-exports
pub use config::{ParameterMode, PredictParams, TrainOverrides};
pub use error::{Error, Result};
pub use model::{ImageClassifier, ModelArchitecture, ModelConfig};
pub use predict::{EnsemblePredictions, EnsemblePredictor};
pub use training::{Trainer, TrainingConfig, TrainingResult};
