//! Classification metrics and the per-epoch metric history
//!
//! - [`accuracy`]: batch top-1 accuracy in percent, computed on logits
//! - [`accuracy_score`] and [`f1_macro`]: epoch-level scores over predicted
//!   and true class indices
//! - [`MetricHistory`]: the six per-epoch series persisted as `Logs.json`

use std::collections::BTreeSet;
use std::path::Path;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// File name of the persisted metric history
pub const LOGS_FILE: &str = "Logs.json";

/// Top-1 accuracy of `(batch, classes)` logits against `(batch,)` targets, in percent
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f64> {
    let batch_size = targets.dim(0)?;
    if batch_size == 0 {
        return Ok(0.0);
    }
    let predictions = logits.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::F64)?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(correct * 100.0 / batch_size as f64)
}

/// Row-wise argmax of `(batch, classes)` logits
pub fn argmax(logits: &Tensor) -> candle_core::Result<Vec<u32>> {
    logits.argmax(D::Minus1)?.to_vec1::<u32>()
}

/// Fraction of matching entries
pub fn accuracy_score(predictions: &[u32], targets: &[u32]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let correct = predictions.iter().zip(targets).filter(|(p, t)| p == t).count();
    correct as f64 / targets.len() as f64
}

/// Unweighted mean of per-class F1 over every class seen in either input
///
/// A class with no true or predicted positives scores 0.
pub fn f1_macro(predictions: &[u32], targets: &[u32]) -> f64 {
    let labels: BTreeSet<u32> = predictions.iter().chain(targets).copied().collect();
    if labels.is_empty() {
        return 0.0;
    }

    let total: f64 = labels
        .iter()
        .map(|&class| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (&pred, &label) in predictions.iter().zip(targets) {
                match (pred == class, label == class) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, true) => fn_ += 1,
                    (false, false) => {}
                }
            }
            if 2 * tp + fp + fn_ == 0 {
                0.0
            } else {
                2.0 * tp as f64 / (2 * tp + fp + fn_) as f64
            }
        })
        .sum();

    total / labels.len() as f64
}

/// Per-epoch training history
///
/// The `test_*` series hold validation-split values. Non-finite values are
/// written as `null` and read back as NaN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(with = "nullable_series")]
    pub train_losses: Vec<f64>,
    #[serde(with = "nullable_series")]
    pub train_accuracies: Vec<f64>,
    #[serde(with = "nullable_series")]
    pub test_losses: Vec<f64>,
    #[serde(with = "nullable_series")]
    pub test_accuracies: Vec<f64>,
    #[serde(with = "nullable_series")]
    pub train_f1s: Vec<f64>,
    #[serde(with = "nullable_series")]
    pub test_f1s: Vec<f64>,
}

mod nullable_series {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(series: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        series
            .iter()
            .map(|v| v.is_finite().then_some(*v))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let series = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(series.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

/// One epoch's entry in [`MetricHistory`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub train_f1: f64,
    pub test_f1: f64,
}

impl MetricHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, epoch: EpochMetrics) {
        self.train_losses.push(epoch.train_loss);
        self.train_accuracies.push(epoch.train_accuracy);
        self.test_losses.push(epoch.test_loss);
        self.test_accuracies.push(epoch.test_accuracy);
        self.train_f1s.push(epoch.train_f1);
        self.test_f1s.push(epoch.test_f1);
    }

    /// Number of recorded epochs
    pub fn len(&self) -> usize {
        self.train_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_losses.is_empty()
    }

    /// Whether all six series have the same length
    pub fn is_consistent(&self) -> bool {
        let n = self.len();
        [
            &self.train_accuracies,
            &self.test_losses,
            &self.test_accuracies,
            &self.train_f1s,
            &self.test_f1s,
        ]
        .iter()
        .all(|series| series.len() == n)
    }

    pub fn best_test_f1(&self) -> Option<f64> {
        self.test_f1s.iter().copied().reduce(f64::max)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!("Wrote metric history ({} epochs) to {:?}", self.len(), path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let history: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if !history.is_consistent() {
            return Err(Error::invalid_input(format!("{:?}: metric series differ in length", path)));
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use test_case::test_case;

    #[test]
    fn test_accuracy_percent() {
        let logits = Tensor::new(
            &[[0.9f32, 0.1], [0.2, 0.8], [0.6, 0.4], [0.3, 0.7]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu).unwrap();
        assert_relative_eq!(accuracy(&logits, &targets).unwrap(), 75.0);
        assert_eq!(argmax(&logits).unwrap(), vec![0, 1, 0, 1]);
    }

    #[test_case(&[0, 1, 2], &[0, 1, 2], 1.0 ; "perfect")]
    #[test_case(&[0, 0, 0, 0], &[0, 1, 0, 1], 0.5 ; "half")]
    #[test_case(&[], &[], 0.0 ; "empty")]
    fn test_accuracy_score(predictions: &[u32], targets: &[u32], expected: f64) {
        assert_relative_eq!(accuracy_score(predictions, targets), expected);
    }

    #[test]
    fn test_f1_macro_matches_hand_computation() {
        // class 0: tp=1 fp=1 fn=1 -> 0.5; class 1: tp=1 fp=0 fn=1 -> 2/3; class 2: tp=0 fp=1 fn=0 -> 0
        let predictions = [0, 0, 1, 2];
        let targets = [0, 1, 1, 0];
        let expected = (0.5 + 2.0 / 3.0 + 0.0) / 3.0;
        assert_relative_eq!(f1_macro(&predictions, &targets), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_f1_macro_symmetric() {
        let a = [0, 2, 1, 1, 2];
        let b = [0, 1, 1, 2, 2];
        assert_relative_eq!(f1_macro(&a, &b), f1_macro(&b, &a));
        assert_relative_eq!(f1_macro(&a, &a), 1.0);
    }

    #[test]
    fn test_history_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(LOGS_FILE);

        let mut history = MetricHistory::new();
        for epoch in 0..3 {
            history.push(EpochMetrics {
                train_loss: 1.0 / (epoch + 1) as f64,
                test_f1: 0.2 * epoch as f64,
                ..Default::default()
            });
        }
        history.save(&path).unwrap();

        let loaded = MetricHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.len(), 3);
        assert!(loaded.is_consistent());
        assert_relative_eq!(loaded.best_test_f1().unwrap(), 0.4);
    }

    #[test]
    fn test_history_tolerates_nan() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(LOGS_FILE);

        let mut history = MetricHistory::new();
        history.push(EpochMetrics {
            train_loss: 0.7,
            test_loss: f64::NAN,
            ..Default::default()
        });
        history.save(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("null"));

        let loaded = MetricHistory::load(&path).unwrap();
        assert!(loaded.test_losses[0].is_nan());
        assert_eq!(loaded.train_losses, vec![0.7]);
        assert!(loaded.is_consistent());
    }

    #[test]
    fn test_load_rejects_ragged_history() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(LOGS_FILE);
        let mut history = MetricHistory::new();
        history.push(EpochMetrics::default());
        history.test_f1s.push(1.0);
        history.save(&path).unwrap();

        assert!(MetricHistory::load(&path).is_err());
    }
}
