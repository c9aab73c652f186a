//! Epoch-level trainer for plankton classifiers
//!
//! This module provides the [`Trainer`] that splits a labelled sample set,
//! fine-tunes a classifier, keeps the best checkpoint by validation F1 and
//! records the per-epoch metric history.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::model::{count_parameters, load_pretrained};
use crate::training::checkpoints::{CheckpointManager, CheckpointMetadata};
use crate::training::config::{SavedParams, TrainingConfig};
use crate::training::data::{AugmentedDataset, DataLoader, DataLoaderConfig, EvalDataset, SampleSet};
use crate::training::early_stopping::EarlyStopping;
use crate::training::loss::{class_weights, CrossEntropyLoss};
use crate::training::metrics::{accuracy_score, f1_macro, EpochMetrics, MetricHistory, LOGS_FILE};
use crate::training::optimizers::{adjust_learning_rate, AdamWOptimizer, LrScheduler, Optimizer, PlateauConfig};
use crate::training::steps::{train_epoch, validate_epoch};

/// Trains one ensemble member ("run") into `<output_dir>/<run_name>/trained_models`
pub struct Trainer {
    /// Training configuration
    config: TrainingConfig,

    /// Directory holding `params.json` and the run directories
    output_dir: PathBuf,

    /// Run (initialization) name
    run_name: String,

    /// Device for training
    device: Device,

    /// Training state
    state: TrainingState,

    /// Event channel for monitoring
    event_tx: Option<mpsc::Sender<TrainingEvent>>,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (0-based)
    pub epoch: usize,

    /// Optimizer steps across all epochs
    pub global_step: usize,

    /// Best validation macro F1
    pub best_f1: f64,

    /// Best validation top-1 accuracy, in percent
    pub best_acc1: f64,

    /// Latest validation top-1 accuracy, in percent
    pub final_acc1: f64,

    /// Learning rate of the current epoch
    pub current_lr: f64,

    /// Training start time
    pub start_time: DateTime<Utc>,

    /// Training status
    pub status: TrainingStatus,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_f1: 0.0,
            best_acc1: 0.0,
            final_acc1: 0.0,
            current_lr: 0.0,
            start_time: Utc::now(),
            status: TrainingStatus::NotStarted,
        }
    }
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    Failed { error: String },
    EarlyStopped,
}

/// Training events for monitoring
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize, lr: f64 },
    EpochCompleted { epoch: usize, metrics: EpochMetrics },
    CheckpointSaved { path: PathBuf, val_f1: f64 },
    LearningRateReduced { epoch: usize, lr: f64 },
    EarlyStopping { epoch: usize },
    TrainingCompleted { epochs_run: usize },
}

/// Scores of the best checkpoint on the held-out test split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub loss: f64,
    pub acc1: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub num_samples: usize,
}

/// Training result information
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Per-epoch metrics
    pub history: MetricHistory,

    /// Path to best model checkpoint
    pub best_checkpoint_path: Option<PathBuf>,

    /// Best checkpoint evaluated on the test split, when there was one
    pub test_summary: Option<TestSummary>,

    /// Class names indexed by label
    pub classes: Vec<String>,

    /// Training duration
    pub training_duration: Duration,
}

impl Trainer {
    /// Create a new trainer instance
    pub fn new(
        config: TrainingConfig,
        output_dir: impl AsRef<Path>,
        run_name: impl Into<String>,
        device: Device,
    ) -> Result<Self> {
        config
            .validate()
            .context("Training configuration validation failed")?;

        Ok(Self {
            config,
            output_dir: output_dir.as_ref().to_path_buf(),
            run_name: run_name.into(),
            device,
            state: TrainingState::default(),
            event_tx: None,
        })
    }

    /// Attach an event channel and return its receiving end
    pub fn with_event_monitoring(mut self) -> (Self, mpsc::Receiver<TrainingEvent>) {
        let (tx, rx) = mpsc::channel();
        self.event_tx = Some(tx);
        (self, rx)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Checkpoint directory of this run
    pub fn checkpoint_dir(&self) -> PathBuf {
        TrainingConfig::checkpoint_dir(&self.output_dir, &self.run_name)
    }

    /// Load an image folder and train on it
    pub fn run_from_folder(&mut self, data_dir: &Path) -> Result<TrainingResult> {
        let samples = SampleSet::from_folder(data_dir)
            .with_context(|| format!("Failed to load dataset from {:?}", data_dir))?;
        self.run(samples)
    }

    /// Split, train and evaluate
    #[instrument(skip(self, samples), fields(run = %self.run_name))]
    pub fn run(&mut self, samples: SampleSet) -> Result<TrainingResult> {
        match self.run_inner(samples) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.state.status = TrainingStatus::Failed { error: e.to_string() };
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, samples: SampleSet) -> Result<TrainingResult> {
        let config = self.config.clone();
        let classes = samples.classes().to_vec();

        let splits = samples
            .split(config.data.val_fraction, config.data.test_fraction, config.training.seed)
            .context("Failed to split dataset")?;

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", self.output_dir))?;
        SavedParams {
            config: config.clone(),
            classes: classes.clone(),
        }
        .save(&self.output_dir)?;

        // Model
        let (var_map, model) = config.model.build(classes.len(), &self.device)?;
        if let Some(path) = config.model.resolve_pretrained()? {
            load_pretrained(&var_map, &path, &self.device)
                .with_context(|| format!("Failed to load pretrained weights from {:?}", path))?;
        }
        let total_params = count_parameters(&var_map);
        info!("{} total parameters.", total_params);
        info!("{} training parameters.", total_params);

        // Data
        let image_size = config.model.image_size as u32;
        let class_counts = splits.train.class_counts();
        let train_loader = DataLoader::new(
            Arc::new(AugmentedDataset::new(splits.train, image_size)),
            self.loader_config(true),
        )?;
        let val_loader = DataLoader::new(
            Arc::new(EvalDataset::new(splits.val, image_size)),
            self.loader_config(false),
        )?;
        let test_loader = DataLoader::new(
            Arc::new(EvalDataset::new(splits.test, image_size)),
            self.loader_config(false),
        )?;

        let criterion = if config.training.class_weighting {
            CrossEntropyLoss::weighted(&class_weights(&class_counts), &self.device)?
        } else {
            CrossEntropyLoss::new()
        };

        let mut optimizer = AdamWOptimizer::from_config(&var_map, &config.optimizer)?;
        let mut lr_scheduler = LrScheduler::new(PlateauConfig {
            factor: config.schedule.plateau_factor,
            patience: config.schedule.plateau_patience,
            min_lr: config.schedule.plateau_min_lr,
            threshold: config.schedule.plateau_threshold,
            ..PlateauConfig::default()
        });
        let mut early_stopping = EarlyStopping::from_config(&config.early_stopping);
        let checkpoints = CheckpointManager::new(self.checkpoint_dir())?;

        let mut history = MetricHistory::new();
        let mut best_checkpoint_path = None;

        self.state = TrainingState {
            status: TrainingStatus::Running,
            ..TrainingState::default()
        };

        info!("Beginning training");
        let time_begin = Instant::now();

        for epoch in 0..config.training.epochs {
            self.state.epoch = epoch;
            info!("EPOCH : {} / {}", epoch + 1, config.training.epochs);

            let scheduled = adjust_learning_rate(
                epoch,
                config.optimizer.learning_rate,
                config.schedule.warmup,
                config.schedule.disable_cos,
                config.training.epochs,
            );
            let lr = lr_scheduler.apply(scheduled);
            optimizer.set_learning_rate(lr);
            self.state.current_lr = lr;
            self.send_event(TrainingEvent::EpochStarted { epoch, lr });

            let train = train_epoch(
                &train_loader,
                epoch,
                model.as_ref(),
                &criterion,
                &mut optimizer,
                config.optimizer.clip_grad_norm,
                &self.device,
            )
            .with_context(|| format!("Training failed at epoch {}", epoch + 1))?;
            let val = validate_epoch(&val_loader, model.as_ref(), &criterion, &self.device, Some(time_begin))
                .with_context(|| format!("Validation failed at epoch {}", epoch + 1))?;
            self.state.global_step = optimizer.step_count();

            let metrics = EpochMetrics {
                train_loss: train.loss,
                train_accuracy: accuracy_score(&train.predictions, &train.targets),
                test_loss: val.loss,
                test_accuracy: accuracy_score(&val.predictions, &val.targets),
                train_f1: f1_macro(&train.predictions, &train.targets),
                test_f1: f1_macro(&val.predictions, &val.targets),
            };

            self.state.best_acc1 = self.state.best_acc1.max(val.accuracy);
            self.state.final_acc1 = val.accuracy;

            if metrics.test_f1 > self.state.best_f1 {
                let metadata = CheckpointMetadata {
                    global_step: self.state.global_step,
                    val_f1: metrics.test_f1,
                    val_accuracy: metrics.test_accuracy,
                    val_loss: val.loss,
                    learning_rate: lr,
                    ..CheckpointMetadata::new(epoch, classes.clone(), model.name())
                };
                let path = checkpoints.save(&var_map, Some(&optimizer), &metadata)?;
                self.send_event(TrainingEvent::CheckpointSaved {
                    path: path.clone(),
                    val_f1: metrics.test_f1,
                });
                best_checkpoint_path = Some(path);
            }
            self.state.best_f1 = self.state.best_f1.max(metrics.test_f1);

            history.push(metrics);
            info!(
                "[Train] Acc:{:.3}, F1:{:.3}, loss:{:.3}",
                metrics.train_accuracy, metrics.train_f1, metrics.train_loss
            );
            info!(
                "[Test] Acc:{:.3}, F1:{:.3}, loss:{:.3}, TIME:{:.3}",
                metrics.test_accuracy, metrics.test_f1, metrics.test_loss, val.elapsed_minutes
            );
            self.send_event(TrainingEvent::EpochCompleted { epoch, metrics });

            if lr_scheduler.step(val.loss, lr) {
                self.send_event(TrainingEvent::LearningRateReduced {
                    epoch,
                    lr: lr_scheduler.apply(scheduled),
                });
            }
            if early_stopping.step(val.loss) {
                self.state.status = TrainingStatus::EarlyStopped;
                self.send_event(TrainingEvent::EarlyStopping { epoch });
                break;
            }
        }

        let training_duration = time_begin.elapsed();
        info!(
            "Script finished in {:.2} minutes, best acc top-1: {:.2}, best f1 top-1: {:.2}, final top-1: {:.2}",
            training_duration.as_secs_f64() / 60.0,
            self.state.best_acc1,
            self.state.best_f1,
            self.state.final_acc1
        );

        history
            .save(&checkpoints.dir().join(LOGS_FILE))
            .context("Failed to write metric history")?;

        let test_summary = if config.training.evaluate_test_split && test_loader.dataset_size() > 0 {
            self.evaluate_best(&checkpoints, &var_map, model.as_ref(), &test_loader, &criterion)?
        } else {
            debug!("Skipping test split evaluation");
            None
        };

        if self.state.status == TrainingStatus::Running {
            self.state.status = TrainingStatus::Completed;
        }
        self.send_event(TrainingEvent::TrainingCompleted {
            epochs_run: history.len(),
        });

        Ok(TrainingResult {
            final_state: self.state.clone(),
            history,
            best_checkpoint_path,
            test_summary,
            classes,
            training_duration,
        })
    }

    /// Reload the best checkpoint and score it on the test split
    fn evaluate_best(
        &self,
        checkpoints: &CheckpointManager,
        var_map: &candle_nn::VarMap,
        model: &dyn crate::model::ImageClassifier,
        test_loader: &DataLoader<EvalDataset>,
        criterion: &CrossEntropyLoss,
    ) -> Result<Option<TestSummary>> {
        if !checkpoints.exists() {
            warn!("No checkpoint was saved; skipping test split evaluation");
            return Ok(None);
        }
        checkpoints.load(var_map, None, &self.device)?;

        let test = validate_epoch(test_loader, model, criterion, &self.device, None)
            .context("Test split evaluation failed")?;
        let summary = TestSummary {
            loss: test.loss,
            acc1: test.accuracy,
            accuracy: accuracy_score(&test.predictions, &test.targets),
            f1: f1_macro(&test.predictions, &test.targets),
            num_samples: test.num_samples(),
        };
        info!(
            "[Best model on test split] Acc:{:.3}, F1:{:.3}, loss:{:.3}",
            summary.accuracy, summary.f1, summary.loss
        );
        Ok(Some(summary))
    }

    fn loader_config(&self, train: bool) -> DataLoaderConfig {
        DataLoaderConfig {
            batch_size: self.config.training.batch_size,
            shuffle: train,
            num_workers: self.config.training.num_workers,
            drop_last: false,
            prefetch_factor: self.config.training.prefetch_factor,
            seed: self.config.training.seed,
        }
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            // A dropped receiver only disables monitoring
            let _ = tx.send(event);
        }
    }
}
