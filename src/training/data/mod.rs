//! Data loading infrastructure for plankton training
//!
//! This module provides the labelled sample sets, the augmentation and
//! evaluation transform chains, dataset wrappers over them and a batched
//! data loader with a worker pool.

use rand::rngs::StdRng;

pub mod datasets;
pub mod loaders;
pub mod transforms;

// Re-exports
pub use datasets::{AugmentedDataset, DataSplits, EvalDataset, SampleSet};
pub use loaders::{Batch, BatchIter, DataLoader, DataLoaderConfig};
pub use transforms::{Compose, Transform};

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a transformed sample by index, drawing any randomness from `rng`
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample, DataError>;

    /// Number of classes the labels range over
    fn num_classes(&self) -> usize;
}

/// A single transformed sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Pixels in CHW order, values in `[0, 1]`
    pub pixels: Vec<f32>,
    /// Image height in pixels
    pub height: usize,
    /// Image width in pixels
    pub width: usize,
    /// Class index
    pub label: u32,
}

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Dataset not found: {path}")]
    DatasetNotFound { path: String },

    #[error("Invalid sample index: {index} >= {dataset_size}")]
    InvalidIndex { index: usize, dataset_size: usize },

    #[error("Failed to decode image {path}: {reason}")]
    ImageDecode { path: String, reason: String },

    #[error("Inconsistent sizes: {images} images, {labels} labels")]
    InconsistentSize { images: usize, labels: usize },

    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: u32, num_classes: usize },

    #[error("Invalid split: {reason}")]
    InvalidSplit { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    TensorError(#[from] candle_core::Error),

    #[error("Batch collation error: {reason}")]
    BatchCollationError { reason: String },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}
