//! One-epoch passes over a data loader: train, validate and predict

use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, instrument};

use super::data::{DataLoader, Dataset};
use super::loss::CrossEntropyLoss;
use super::metrics::{accuracy, argmax};
use super::optimizers::{clip_grad_norm, AdamWOptimizer, Optimizer};
use crate::model::ImageClassifier;

/// Averages and per-sample outputs of one epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochOutput {
    /// Sample-weighted top-1 accuracy, in percent
    pub accuracy: f64,
    /// Sample-weighted mean loss
    pub loss: f64,
    /// Argmax class per sample, in loader order
    pub predictions: Vec<u32>,
    /// True class per sample, in loader order
    pub targets: Vec<u32>,
    /// Minutes since the caller's start instant, or -1 when none was given
    pub elapsed_minutes: f64,
}

impl EpochOutput {
    pub fn num_samples(&self) -> usize {
        self.targets.len()
    }
}

/// [`EpochOutput`] plus per-sample class probabilities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictOutput {
    pub epoch: EpochOutput,
    /// Softmax probabilities per sample, in loader order
    pub probabilities: Vec<Vec<f32>>,
    /// Dataset index per sample, in loader order
    pub indices: Vec<usize>,
}

#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    acc_sum: f64,
    n: usize,
    predictions: Vec<u32>,
    targets: Vec<u32>,
}

impl Accumulator {
    fn add(&mut self, logits: &Tensor, labels: &Tensor, loss: &Tensor) -> candle_core::Result<()> {
        let batch_size = labels.dim(0)?;
        let loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let acc1 = accuracy(logits, labels)?;

        self.loss_sum += loss * batch_size as f64;
        self.acc_sum += acc1 * batch_size as f64;
        self.n += batch_size;
        self.predictions.extend(argmax(logits)?);
        self.targets.extend(labels.to_vec1::<u32>()?);
        Ok(())
    }

    fn finish(self, time_begin: Option<Instant>) -> EpochOutput {
        let n = self.n.max(1) as f64;
        EpochOutput {
            accuracy: self.acc_sum / n,
            loss: self.loss_sum / n,
            predictions: self.predictions,
            targets: self.targets,
            elapsed_minutes: time_begin
                .map(|t| t.elapsed().as_secs_f64() / 60.0)
                .unwrap_or(-1.0),
        }
    }
}

/// One optimization pass over every batch of `loader`
///
/// Gradients are clipped to a global L2 norm of `clip_grad_norm_max` when it is
/// positive.
#[instrument(skip_all, fields(epoch = epoch))]
pub fn train_epoch<D: Dataset + 'static>(
    loader: &DataLoader<D>,
    epoch: usize,
    model: &dyn ImageClassifier,
    criterion: &CrossEntropyLoss,
    optimizer: &mut AdamWOptimizer,
    clip_grad_norm_max: f64,
    device: &Device,
) -> Result<EpochOutput> {
    let vars = optimizer.vars();
    let mut acc = Accumulator::default();

    for (step, batch) in loader.epoch_iter(epoch).enumerate() {
        let batch = batch.context("Failed to load training batch")?;
        let images = batch.images.to_device(device)?;
        let labels = batch.labels.to_device(device)?;

        let logits = model.forward(&images, true)?;
        let loss = criterion.forward(&logits, &labels)?;
        acc.add(&logits, &labels, &loss)?;

        let mut grads = loss.backward().context("Backward pass failed")?;
        if clip_grad_norm_max > 0.0 {
            let norm = clip_grad_norm(&vars, &mut grads, clip_grad_norm_max)?;
            debug!("step {}: grad norm {:.4}", step, norm);
        }
        optimizer.step(&grads).context("Optimizer step failed")?;
    }

    Ok(acc.finish(None))
}

/// Loss and accuracy over `loader` without parameter updates
#[instrument(skip_all)]
pub fn validate_epoch<D: Dataset + 'static>(
    loader: &DataLoader<D>,
    model: &dyn ImageClassifier,
    criterion: &CrossEntropyLoss,
    device: &Device,
    time_begin: Option<Instant>,
) -> Result<EpochOutput> {
    let mut acc = Accumulator::default();

    for batch in loader.epoch_iter(0) {
        let batch = batch.context("Failed to load validation batch")?;
        let images = batch.images.to_device(device)?;
        let labels = batch.labels.to_device(device)?;

        let logits = model.forward(&images, false)?.detach();
        let loss = criterion.forward(&logits, &labels)?;
        acc.add(&logits, &labels, &loss)?;
    }

    Ok(acc.finish(time_begin))
}

/// Like [`validate_epoch`], also collecting softmax probabilities
#[instrument(skip_all)]
pub fn predict_epoch<D: Dataset + 'static>(
    loader: &DataLoader<D>,
    model: &dyn ImageClassifier,
    criterion: &CrossEntropyLoss,
    device: &Device,
    time_begin: Option<Instant>,
) -> Result<PredictOutput> {
    let started = Instant::now();
    let mut acc = Accumulator::default();
    let mut probabilities = Vec::with_capacity(loader.dataset_size());
    let mut indices = Vec::with_capacity(loader.dataset_size());

    for batch in loader.epoch_iter(0) {
        let batch = batch.context("Failed to load prediction batch")?;
        let images = batch.images.to_device(device)?;
        let labels = batch.labels.to_device(device)?;

        let logits = model.forward(&images, false)?.detach();
        let loss = criterion.forward(&logits, &labels)?;
        acc.add(&logits, &labels, &loss)?;

        let probs = candle_nn::ops::softmax(&logits, candle_core::D::Minus1)?;
        probabilities.extend(probs.to_dtype(DType::F32)?.to_vec2::<f32>()?);
        indices.extend(batch.indices);
    }

    info!(
        "Predicted {} samples in {:.2} minutes",
        indices.len(),
        started.elapsed().as_secs_f64() / 60.0
    );

    Ok(PredictOutput {
        epoch: acc.finish(time_begin),
        probabilities,
        indices,
    })
}
