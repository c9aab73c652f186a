//! Loss functions for plankton classifier training
//!
//! Cross entropy over class logits, optionally weighted per class so that
//! rare plankton classes contribute as much to the gradient as common ones.

use candle_core::{DType, Device, Tensor, D};
use candle_nn as nn;
use tracing::debug;

/// Cross-entropy loss for classification
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    weights: Option<Tensor>,
}

impl CrossEntropyLoss {
    /// Unweighted mean over the batch
    pub fn new() -> Self {
        Self { weights: None }
    }

    /// Weighted mean: `sum_i w[y_i] * nll_i / sum_i w[y_i]`
    pub fn weighted(weights: &[f32], device: &Device) -> candle_core::Result<Self> {
        debug!("Class weights: {:?}", weights);
        Ok(Self {
            weights: Some(Tensor::from_slice(weights, weights.len(), device)?),
        })
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    /// Scalar loss for `(batch, classes)` logits and `(batch,)` u32 targets
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        let targets = targets.to_dtype(DType::U32)?;
        let log_probs = nn::ops::log_softmax(logits, D::Minus1)?;
        let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;

        match &self.weights {
            None => picked.mean_all()?.neg(),
            Some(weights) => {
                let w = weights.to_dtype(picked.dtype())?.index_select(&targets, 0)?;
                let norm = w.sum_all()?;
                // Batch made only of classes absent from training
                if norm.to_dtype(DType::F64)?.to_scalar::<f64>()? == 0.0 {
                    return Tensor::zeros((), picked.dtype(), picked.device());
                }
                let total = (picked * &w)?.sum_all()?.neg()?;
                total / norm
            }
        }
    }
}

/// Balanced class weights `n_samples / (n_classes * count_c)`
///
/// Classes with no samples get weight 0.
pub fn class_weights(counts: &[usize]) -> Vec<f32> {
    let n_samples: usize = counts.iter().sum();
    let n_classes = counts.len();
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                n_samples as f32 / (n_classes * count) as f32
            }
        })
        .collect()
}
