//! Optimizers and learning rate schedules for plankton training
//!
//! This module provides the AdamW optimizer over a [`VarMap`], global
//! gradient-norm clipping and the epoch-level learning rate policy.

pub mod adamw;
pub mod schedulers;

pub use adamw::AdamWOptimizer;
pub use schedulers::{adjust_learning_rate, LrScheduler, PlateauConfig};

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Perform optimization step
    fn step(&mut self, gradients: &GradStore) -> candle_core::Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get current step count
    fn step_count(&self) -> usize;

    /// Per-parameter state tensors for checkpointing
    fn state_tensors(&self) -> HashMap<String, Tensor>;

    /// Restore state written by [`Optimizer::state_tensors`]
    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>, step_count: usize) -> Result<()>;
}

/// Rescale gradients in place so their global L2 norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> candle_core::Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sum_sq += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let total_norm = sum_sq.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.affine(clip_coef, 0.0)?);
            }
        }
    }
    Ok(total_norm)
}
