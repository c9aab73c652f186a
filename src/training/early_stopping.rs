//! Early stopping on validation loss

use serde::{Deserialize, Serialize};
use tracing::info;

/// Stops training once validation loss has not improved by more than
/// `min_delta` for `patience` consecutive epochs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    counter: usize,
    best_loss: Option<f64>,
    early_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
            early_stop: false,
        }
    }

    pub fn from_config(config: &crate::training::config::EarlyStoppingConfig) -> Self {
        Self::new(config.patience, config.min_delta)
    }

    /// Observe one epoch's validation loss; returns whether to stop
    pub fn step(&mut self, val_loss: f64) -> bool {
        match self.best_loss {
            None => self.best_loss = Some(val_loss),
            Some(best) if best - val_loss > self.min_delta => {
                self.best_loss = Some(val_loss);
                self.counter = 0;
            }
            Some(_) => {
                self.counter += 1;
                info!("Early stopping counter {} of {}", self.counter, self.patience);
                if self.counter >= self.patience {
                    info!("Early stopping");
                    self.early_stop = true;
                }
            }
        }
        self.early_stop
    }

    pub fn should_stop(&self) -> bool {
        self.early_stop
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(5, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_call_records_best() {
        let mut stopping = EarlyStopping::default();
        assert!(!stopping.step(0.8));
        assert_eq!(stopping.best_loss(), Some(0.8));
        assert_eq!(stopping.counter(), 0);
    }

    #[test]
    fn test_stops_after_patience() {
        let mut stopping = EarlyStopping::default();
        stopping.step(1.0);
        for expected in 1..5 {
            assert!(!stopping.step(1.2));
            assert_eq!(stopping.counter(), expected);
        }
        assert!(stopping.step(1.1));
        assert!(stopping.should_stop());
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut stopping = EarlyStopping::new(3, 0.0);
        stopping.step(1.0);
        stopping.step(1.5);
        stopping.step(1.5);
        assert_eq!(stopping.counter(), 2);

        stopping.step(0.5);
        assert_eq!(stopping.counter(), 0);
        assert_eq!(stopping.best_loss(), Some(0.5));
    }

    #[test]
    fn test_equal_loss_counts_as_no_improvement() {
        let mut stopping = EarlyStopping::new(2, 0.0);
        stopping.step(1.0);
        stopping.step(1.0);
        assert_eq!(stopping.counter(), 1);
    }

    #[test]
    fn test_min_delta_boundary() {
        let mut stopping = EarlyStopping::new(5, 0.25);
        stopping.step(1.0);
        // Exactly min_delta better is not an improvement
        stopping.step(0.75);
        assert_eq!(stopping.counter(), 1);
        assert_eq!(stopping.best_loss(), Some(1.0));
    }

    proptest! {
        #[test]
        fn prop_counter_moves_only_by_rule(
            losses in prop::collection::vec(0.0f64..10.0, 1..40),
            min_delta in 0.0f64..1.0,
        ) {
            let mut stopping = EarlyStopping::new(usize::MAX, min_delta);
            stopping.step(losses[0]);
            for &loss in &losses[1..] {
                let best = stopping.best_loss().unwrap();
                let before = stopping.counter();
                stopping.step(loss);
                if best - loss > min_delta {
                    prop_assert_eq!(stopping.counter(), 0);
                    prop_assert_eq!(stopping.best_loss(), Some(loss));
                } else {
                    prop_assert_eq!(stopping.counter(), before + 1);
                    prop_assert_eq!(stopping.best_loss(), Some(best));
                }
            }
        }
    }
}
