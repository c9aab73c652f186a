//! Data loaders for plankton training with a worker pool and batch prefetching

use super::{DataError, Dataset, Sample};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, instrument};

/// Configuration for DataLoader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data every epoch
    pub shuffle: bool,
    /// Number of worker threads transforming samples
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Prefetch factor (number of batches buffered ahead of the consumer)
    pub prefetch_factor: usize,
    /// Base seed for shuffling and per-sample augmentation
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            num_workers: 4,
            drop_last: false,
            prefetch_factor: 2,
            seed: 42,
        }
    }
}

/// A collated batch on the CPU
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, 3, H, W)` f32 images
    pub images: Tensor,
    /// `(batch,)` u32 class indices
    pub labels: Tensor,
    /// Dataset indices of the samples, in batch order
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Batched data loader
pub struct DataLoader<D: Dataset + 'static> {
    /// Dataset reference
    dataset: Arc<D>,
    /// DataLoader configuration
    config: DataLoaderConfig,
    /// Workers shared by every epoch
    pool: Arc<ThreadPool>,
}

impl<D: Dataset + 'static> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig) -> Result<Self, DataError> {
        if config.batch_size == 0 {
            return Err(DataError::BatchCollationError {
                reason: "batch_size must be greater than 0".to_string(),
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .thread_name(|i| format!("plankton-loader-{}", i))
            .build()
            .map_err(|e| DataError::WorkerPool(e.to_string()))?;

        info!(
            "Creating DataLoader with batch_size={}, num_workers={}, shuffle={}",
            config.batch_size, config.num_workers, config.shuffle
        );

        Ok(Self {
            dataset,
            config,
            pool: Arc::new(pool),
        })
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            dataset_size.div_ceil(self.config.batch_size)
        }
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Start a background producer for one epoch and iterate its batches
    ///
    /// The shuffle order and every sample's augmentation are functions of
    /// `(seed, epoch)`, independent of worker scheduling.
    #[instrument(skip(self))]
    pub fn epoch_iter(&self, epoch: usize) -> BatchIter {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            indices.shuffle(&mut rng);
        }

        let batches = self.create_batches(indices);
        let total = batches.len();
        debug!("Epoch {}: {} batches", epoch, total);

        let (tx, rx) = sync_channel(self.config.prefetch_factor.max(1));
        let dataset = Arc::clone(&self.dataset);
        let pool = Arc::clone(&self.pool);
        let seed = self.config.seed;

        let handle = std::thread::spawn(move || {
            for batch_indices in batches {
                let batch = collate(dataset.as_ref(), &pool, batch_indices, seed, epoch);
                let failed = batch.is_err();
                // Receiver gone: the epoch iterator was dropped
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });

        BatchIter {
            rx: Some(rx),
            handle: Some(handle),
            remaining: total,
        }
    }

    /// Create batches from indices
    fn create_batches(&self, indices: Vec<usize>) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();

        for chunk in indices.chunks(self.config.batch_size) {
            if self.config.drop_last && chunk.len() < self.config.batch_size {
                break;
            }
            batches.push(chunk.to_vec());
        }

        batches
    }
}

/// Per-sample rng seed
pub(crate) fn sample_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    seed ^ ((epoch as u64) << 32) ^ index as u64
}

fn collate<D: Dataset>(
    dataset: &D,
    pool: &ThreadPool,
    indices: Vec<usize>,
    seed: u64,
    epoch: usize,
) -> Result<Batch, DataError> {
    let samples: Vec<Sample> = pool.install(|| {
        indices
            .par_iter()
            .map(|&index| {
                let mut rng = StdRng::seed_from_u64(sample_seed(seed, epoch, index));
                dataset.get(index, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    let first = samples.first().ok_or_else(|| DataError::BatchCollationError {
        reason: "empty batch".to_string(),
    })?;
    let (height, width) = (first.height, first.width);

    let mut pixels = Vec::with_capacity(samples.len() * 3 * height * width);
    let mut labels = Vec::with_capacity(samples.len());
    for (sample, index) in samples.iter().zip(&indices) {
        if (sample.height, sample.width) != (height, width) {
            return Err(DataError::BatchCollationError {
                reason: format!(
                    "sample {} is {}x{}, batch is {}x{}",
                    index, sample.height, sample.width, height, width
                ),
            });
        }
        pixels.extend_from_slice(&sample.pixels);
        labels.push(sample.label);
    }

    let batch_size = samples.len();
    Ok(Batch {
        images: Tensor::from_vec(pixels, (batch_size, 3, height, width), &Device::Cpu)?,
        labels: Tensor::from_vec(labels, batch_size, &Device::Cpu)?,
        indices,
    })
}

/// Batches of one epoch, produced ahead of time by a background thread
///
/// Dropping the iterator early stops and joins the producer.
pub struct BatchIter {
    rx: Option<Receiver<Result<Batch, DataError>>>,
    handle: Option<JoinHandle<()>>,
    remaining: usize,
}

impl Iterator for BatchIter {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rx.as_ref()?.recv().ok()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // Close the channel first so a blocked producer wakes up
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
