//! Learning rate schedules for training optimization
//!
//! Two mechanisms combine every epoch: [`adjust_learning_rate`] computes the
//! warmup/cosine rate for the epoch, and [`LrScheduler`] multiplies it by a
//! decay factor that shrinks whenever validation loss plateaus.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Warmup then cosine learning rate for `epoch`
///
/// During warmup the rate is `lr / (warmup - epoch)`; afterwards it follows a
/// half cosine from `lr` towards 0 over the remaining epochs, or stays at `lr`
/// when `disable_cos` is set.
pub fn adjust_learning_rate(epoch: usize, lr: f64, warmup: usize, disable_cos: bool, epochs: usize) -> f64 {
    if epoch < warmup {
        lr / (warmup - epoch) as f64
    } else if !disable_cos && epochs > warmup {
        let progress = (epoch - warmup) as f64 / (epochs - warmup) as f64;
        lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    } else {
        lr
    }
}

/// Reduce-on-plateau settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    /// Multiplier applied on each reduction
    pub factor: f64,
    /// Non-improving epochs tolerated before a reduction
    pub patience: usize,
    /// Lower bound on the reduced learning rate
    pub min_lr: f64,
    /// Relative improvement required to reset patience
    pub threshold: f64,
    /// Reductions smaller than this are skipped
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 4,
            min_lr: 1e-10,
            threshold: 1e-4,
            eps: 1e-8,
        }
    }
}

/// Reduce-on-plateau scheduler over validation loss (mode `min`)
///
/// The scheduler holds a multiplicative `scale` starting at 1. A loss counts
/// as an improvement when it is below `best * (1 - threshold)`; once more than
/// `patience` consecutive epochs fail to improve, the scale shrinks so that the
/// current rate becomes `max(rate * factor, min_lr)`, and the count restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    config: PlateauConfig,
    best: Option<f64>,
    num_bad_epochs: usize,
    scale: f64,
    num_reductions: usize,
}

impl LrScheduler {
    pub fn new(config: PlateauConfig) -> Self {
        Self {
            config,
            best: None,
            num_bad_epochs: 0,
            scale: 1.0,
            num_reductions: 0,
        }
    }

    /// Current multiplier on the scheduled learning rate
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Apply the plateau decay to a scheduled rate
    pub fn apply(&self, lr: f64) -> f64 {
        lr * self.scale
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    pub fn num_reductions(&self) -> usize {
        self.num_reductions
    }

    /// Observe a validation loss with the rate used this epoch; returns true
    /// when the rate was reduced
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => val_loss < best * (1.0 - self.config.threshold),
        };

        if improved {
            self.best = Some(val_loss);
            self.num_bad_epochs = 0;
            return false;
        }

        self.num_bad_epochs += 1;
        if self.num_bad_epochs <= self.config.patience {
            return false;
        }

        self.num_bad_epochs = 0;
        let new_lr = (current_lr * self.config.factor).max(self.config.min_lr);
        if current_lr - new_lr <= self.config.eps || current_lr <= 0.0 {
            return false;
        }

        self.scale *= new_lr / current_lr;
        self.num_reductions += 1;
        info!("Reducing learning rate to {:.4e}", new_lr);
        true
    }
}

impl Default for LrScheduler {
    fn default() -> Self {
        Self::new(PlateauConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(0, 0.05 ; "first warmup epoch")]
    #[test_case(1, 0.1 ; "last warmup epoch")]
    fn test_warmup_scenario(epoch: usize, expected: f64) {
        assert_relative_eq!(adjust_learning_rate(epoch, 0.1, 2, true, 10), expected);
    }

    #[test]
    fn test_cosine_endpoints() {
        assert_relative_eq!(adjust_learning_rate(3, 1e-3, 3, false, 13), 1e-3);
        assert_relative_eq!(adjust_learning_rate(8, 1e-3, 3, false, 13), 5e-4, epsilon = 1e-12);
        assert_relative_eq!(adjust_learning_rate(3, 1e-3, 3, true, 13), 1e-3);
    }

    #[test]
    fn test_plateau_fires_after_patience_exceeded() {
        let mut scheduler = LrScheduler::default();
        let lr = 1e-3;

        assert!(!scheduler.step(1.0, lr));
        for _ in 0..4 {
            assert!(!scheduler.step(1.0, lr));
        }
        assert_eq!(scheduler.num_bad_epochs(), 4);

        assert!(scheduler.step(1.0, lr));
        assert_relative_eq!(scheduler.scale(), 0.5);
        assert_eq!(scheduler.num_bad_epochs(), 0);
        assert_relative_eq!(scheduler.apply(2e-3), 1e-3);
    }

    #[test]
    fn test_threshold_is_relative() {
        let mut scheduler = LrScheduler::default();
        scheduler.step(1.0, 1e-3);
        // Improvement smaller than 1e-4 relative does not reset the count
        scheduler.step(0.99995, 1e-3);
        assert_eq!(scheduler.num_bad_epochs(), 1);
        scheduler.step(0.9, 1e-3);
        assert_eq!(scheduler.num_bad_epochs(), 0);
    }

    #[test]
    fn test_min_lr_floor() {
        let config = PlateauConfig {
            patience: 0,
            min_lr: 4e-4,
            ..Default::default()
        };
        let mut scheduler = LrScheduler::new(config);
        scheduler.step(1.0, 1e-3);
        assert!(scheduler.step(1.0, 1e-3));
        assert_relative_eq!(scheduler.apply(1e-3), 5e-4, epsilon = 1e-15);
        assert!(scheduler.step(1.0, 5e-4));
        assert_relative_eq!(scheduler.apply(1e-3), 4e-4, epsilon = 1e-15);
        // Already at the floor
        assert!(!scheduler.step(1.0, 4e-4));
    }

    proptest! {
        #[test]
        fn prop_warmup_is_increasing_and_bounded(lr in 1e-6f64..1.0, warmup in 1usize..20) {
            let mut previous = 0.0;
            for epoch in 0..warmup {
                let rate = adjust_learning_rate(epoch, lr, warmup, false, warmup + 10);
                prop_assert!(rate > previous);
                prop_assert!(rate <= lr * (1.0 + 1e-12));
                previous = rate;
            }
        }

        #[test]
        fn prop_cosine_within_bounds(lr in 1e-6f64..1.0, warmup in 0usize..10, extra in 1usize..50, offset in 0usize..50) {
            let epochs = warmup + extra;
            let epoch = warmup + offset % extra;
            let rate = adjust_learning_rate(epoch, lr, warmup, false, epochs);
            prop_assert!(rate > 0.0);
            prop_assert!(rate <= lr * (1.0 + 1e-12));
        }
    }
}
