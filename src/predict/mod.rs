//! Ensemble prediction over held-out plankton imagery
//!
//! An ensemble is a training output directory holding `params.json` and one
//! checkpoint directory per initialization name. Every member classifies the
//! same non-shuffled loader; the per-sample softmax probabilities are averaged
//! and the argmax of the average is the predicted class.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::PredictParams;
use crate::model::ImageClassifier;
use crate::training::checkpoints::{CheckpointManager, CheckpointMetadata};
use crate::training::config::{SavedParams, TrainingConfig};
use crate::training::data::{DataLoader, DataLoaderConfig, EvalDataset, SampleSet};
use crate::training::loss::CrossEntropyLoss;
use crate::training::steps::predict_epoch;
use crate::utils::io::write_file_atomic;

/// File name of the ensemble output
pub const PREDICTIONS_FILE: &str = "predictions.json";

/// One trained model of the ensemble
pub struct EnsembleMember {
    pub name: String,
    pub metadata: CheckpointMetadata,
    model: Box<dyn ImageClassifier>,
    // Owns the variables the model reads
    _var_map: candle_nn::VarMap,
}

impl EnsembleMember {
    pub fn model(&self) -> &dyn ImageClassifier {
        self.model.as_ref()
    }
}

/// Prediction for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePrediction {
    pub path: PathBuf,
    pub label: u32,
    pub class: String,
    /// Averaged probability of the predicted class
    pub confidence: f32,
    /// Averaged probabilities, indexed by label
    pub probabilities: Vec<f32>,
}

/// Ensemble output written as `predictions.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePredictions {
    pub classes: Vec<String>,
    pub members: Vec<String>,
    pub predictions: Vec<FilePrediction>,
}

impl EnsemblePredictions {
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Number of predictions per class index
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for prediction in &self.predictions {
            counts[prediction.label as usize] += 1;
        }
        counts
    }

    pub fn save(&self, outpath: &Path) -> Result<PathBuf> {
        let path = outpath.join(PREDICTIONS_FILE);
        write_file_atomic(&path, serde_json::to_string_pretty(self)?.as_bytes())?;
        info!("Wrote {} predictions to {:?}", self.len(), path);
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Loads every member of a trained ensemble and averages their predictions
pub struct EnsemblePredictor {
    config: TrainingConfig,
    classes: Vec<String>,
    members: Vec<EnsembleMember>,
    device: Device,
}

impl EnsemblePredictor {
    /// Load `params.json` and the best checkpoint of every init under `main_model_path`
    #[instrument(skip(init_names, device))]
    pub fn load(main_model_path: &Path, init_names: &[String], device: Device) -> Result<Self> {
        if init_names.is_empty() {
            bail!("at least one init name is required");
        }

        let SavedParams { config, classes } = SavedParams::load(main_model_path)?;
        info!("Loaded training parameters: {} classes", classes.len());

        let mut members = Vec::with_capacity(init_names.len());
        for name in init_names {
            let dir = TrainingConfig::checkpoint_dir(main_model_path, name);
            let manager = CheckpointManager::open(&dir)
                .with_context(|| format!("No trained model for init '{}' in {:?}", name, dir))?;

            let (var_map, model) = config.model.build(classes.len(), &device)?;
            let metadata = manager
                .load(&var_map, None, &device)
                .with_context(|| format!("Failed to load checkpoint of init '{}'", name))?;
            if metadata.classes != classes {
                bail!(
                    "init '{}' was trained on classes {:?}, params.json lists {:?}",
                    name,
                    metadata.classes,
                    classes
                );
            }
            info!(
                "Loaded init '{}' from epoch {} (val F1 {:.4})",
                name,
                metadata.epoch + 1,
                metadata.val_f1
            );

            members.push(EnsembleMember {
                name: name.clone(),
                metadata,
                model,
                _var_map: var_map,
            });
        }

        Ok(Self {
            config,
            classes,
            members,
            device,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Classify every image below `test_paths`
    pub fn predict_paths<P: AsRef<Path>>(&self, test_paths: &[P]) -> Result<EnsemblePredictions> {
        let samples = SampleSet::from_unlabeled(test_paths, self.classes.clone())?;
        self.predict_samples(samples)
    }

    /// Classify a sample set; its labels are ignored
    #[instrument(skip_all, fields(samples = samples.len()))]
    pub fn predict_samples(&self, samples: SampleSet) -> Result<EnsemblePredictions> {
        let paths = samples.paths().to_vec();
        let member_names = self.members.iter().map(|m| m.name.clone()).collect();
        if samples.is_empty() {
            warn!("No images to classify");
            return Ok(EnsemblePredictions {
                classes: self.classes.clone(),
                members: member_names,
                predictions: Vec::new(),
            });
        }

        let training = &self.config.training;
        let loader = DataLoader::new(
            Arc::new(EvalDataset::new(samples, self.config.model.image_size as u32)),
            DataLoaderConfig {
                batch_size: training.batch_size,
                shuffle: false,
                num_workers: training.num_workers,
                drop_last: false,
                prefetch_factor: training.prefetch_factor,
                seed: training.seed,
            },
        )?;

        let criterion = CrossEntropyLoss::new();
        let time_begin = Instant::now();
        let mut per_member = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let output = predict_epoch(&loader, member.model(), &criterion, &self.device, Some(time_begin))
                .with_context(|| format!("Prediction failed for init '{}'", member.name))?;
            per_member.push(in_dataset_order(output.probabilities, &output.indices, paths.len())?);
        }

        let averaged = average_probabilities(&per_member)?;
        let predictions = paths
            .into_iter()
            .zip(averaged)
            .map(|(path, probabilities)| {
                let (label, confidence) =
                    best_class(&probabilities).with_context(|| format!("Cannot classify {:?}", path))?;
                Ok(FilePrediction {
                    path,
                    label: label as u32,
                    class: self.classes[label].clone(),
                    confidence,
                    probabilities,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EnsemblePredictions {
            classes: self.classes.clone(),
            members: member_names,
            predictions,
        })
    }
}

/// Run a full prediction from parsed input parameters; returns the output file
pub fn run_prediction(params: &PredictParams, device: Device) -> Result<PathBuf> {
    params.create_out_dir()?;
    let predictor = EnsemblePredictor::load(&params.main_model_path, &params.init_names, device)?;
    let predictions = predictor.predict_paths(params.test_path.as_slice())?;

    for (class, count) in predictions.classes.iter().zip(predictions.class_counts()) {
        info!("{}: {}", class, count);
    }
    predictions.save(&params.outpath)
}

fn in_dataset_order(rows: Vec<Vec<f32>>, indices: &[usize], len: usize) -> Result<Vec<Vec<f32>>> {
    if rows.len() != len || indices.len() != len {
        bail!("expected {} predictions, got {}", len, rows.len());
    }
    let mut ordered = vec![Vec::new(); len];
    for (row, &index) in rows.into_iter().zip(indices) {
        ordered[index] = row;
    }
    Ok(ordered)
}

/// Element-wise mean over members; all members must agree on shape
pub fn average_probabilities(per_member: &[Vec<Vec<f32>>]) -> Result<Vec<Vec<f32>>> {
    let Some(first) = per_member.first() else {
        bail!("no member predictions to average");
    };
    let mut sum = first.clone();
    for member in &per_member[1..] {
        if member.len() != sum.len() {
            bail!("members predicted {} and {} samples", sum.len(), member.len());
        }
        for (acc, row) in sum.iter_mut().zip(member) {
            if acc.len() != row.len() {
                bail!("members predicted {} and {} classes", acc.len(), row.len());
            }
            acc.iter_mut().zip(row).for_each(|(a, p)| *a += p);
        }
    }

    let n = per_member.len() as f32;
    for row in &mut sum {
        row.iter_mut().for_each(|p| *p /= n);
    }
    Ok(sum)
}

/// Index and value of the first maximum; fails on an empty or non-finite row
fn best_class(probabilities: &[f32]) -> Result<(usize, f32)> {
    if probabilities.is_empty() {
        bail!("empty probability row");
    }
    if let Some(p) = probabilities.iter().find(|p| !p.is_finite()) {
        bail!("non-finite probability {} in {:?}", p, probabilities);
    }
    Ok(probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_average_probabilities() {
        let a = vec![vec![0.9, 0.1], vec![0.2, 0.8]];
        let b = vec![vec![0.5, 0.5], vec![0.4, 0.6]];
        let avg = average_probabilities(&[a, b]).unwrap();

        assert_relative_eq!(avg[0][0], 0.7, epsilon = 1e-6);
        assert_relative_eq!(avg[1][1], 0.7, epsilon = 1e-6);
        assert_relative_eq!(avg[1].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_average_rejects_mismatch() {
        assert!(average_probabilities(&[]).is_err());
        let a = vec![vec![0.5, 0.5]];
        let b = vec![vec![0.5, 0.5], vec![1.0, 0.0]];
        assert!(average_probabilities(&[a.clone(), b]).is_err());
        assert!(average_probabilities(&[a, vec![vec![1.0, 0.0, 0.0]]]).is_err());
    }

    #[test]
    fn test_best_class_takes_first_maximum() {
        assert_eq!(best_class(&[0.2, 0.5, 0.3]).unwrap(), (1, 0.5));
        assert_eq!(best_class(&[0.5, 0.5]).unwrap().0, 0);
    }

    #[test]
    fn test_best_class_rejects_non_finite_rows() {
        assert!(best_class(&[f32::NAN, f32::NAN]).is_err());
        assert!(best_class(&[0.4, f32::NAN, 0.6]).is_err());
        assert!(best_class(&[f32::INFINITY, 0.0]).is_err());
        assert!(best_class(&[]).is_err());
    }

    #[test]
    fn test_in_dataset_order() {
        let rows = vec![vec![1.0], vec![2.0], vec![3.0]];
        let ordered = in_dataset_order(rows, &[2, 0, 1], 3).unwrap();
        assert_eq!(ordered, vec![vec![2.0], vec![3.0], vec![1.0]]);
        assert!(in_dataset_order(vec![vec![1.0]], &[0], 2).is_err());
    }

    #[test]
    fn test_load_requires_params() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = EnsemblePredictor::load(temp_dir.path(), &["Init_0".to_string()], Device::Cpu);
        assert!(result.is_err());
        let result = EnsemblePredictor::load(temp_dir.path(), &[], Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_predictions_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let predictions = EnsemblePredictions {
            classes: vec!["copepod".into(), "diatom".into()],
            members: vec!["Init_0".into()],
            predictions: vec![FilePrediction {
                path: PathBuf::from("data/x.png"),
                label: 1,
                class: "diatom".into(),
                confidence: 0.75,
                probabilities: vec![0.25, 0.75],
            }],
        };
        let path = predictions.save(temp_dir.path()).unwrap();
        assert_eq!(EnsemblePredictions::load(&path).unwrap(), predictions);
        assert_eq!(predictions.class_counts(), vec![0, 1]);
    }
}
