//! AdamW optimizer implementation
//!
//! This module provides the AdamW optimizer with decoupled weight decay over
//! the named variables of a [`VarMap`]. Moment estimates are keyed by variable
//! name so they can be written to and restored from a checkpoint.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use super::Optimizer;
use crate::error::{Error, Result};

const MOMENTUM_PREFIX: &str = "m.";
const VARIANCE_PREFIX: &str = "v.";

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Named parameters, sorted by name
    vars: Vec<(String, Var)>,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First moment estimates (momentum)
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates (RMSprop)
    variance: HashMap<String, Tensor>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer over every variable in `var_map`
    pub fn new(
        var_map: &VarMap,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = var_map
            .data()
            .lock()
            .map_err(|_| Error::model("variable map lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("AdamW over {} parameter tensors", vars.len());

        Ok(Self {
            vars,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        })
    }

    /// Build from the optimizer section of a training config
    pub fn from_config(var_map: &VarMap, config: &crate::training::config::OptimizerConfig) -> Result<Self> {
        Self::new(
            var_map,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )
    }

    /// The optimized variables, in name order
    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|(_, var)| var.clone()).collect()
    }

    /// Apply AdamW update to a parameter
    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> candle_core::Result<()> {
        let t = self.step_count as i32;

        // m_t = β₁ * m_{t-1} + (1 - β₁) * g_t
        let momentum = match self.momentum.get(name) {
            Some(m) => m.affine(self.beta1, 0.0)?.add(&grad.affine(1.0 - self.beta1, 0.0)?)?,
            None => grad.affine(1.0 - self.beta1, 0.0)?,
        };

        // v_t = β₂ * v_{t-1} + (1 - β₂) * g_t²
        let grad_squared = grad.sqr()?;
        let variance = match self.variance.get(name) {
            Some(v) => v
                .affine(self.beta2, 0.0)?
                .add(&grad_squared.affine(1.0 - self.beta2, 0.0)?)?,
            None => grad_squared.affine(1.0 - self.beta2, 0.0)?,
        };

        // Bias correction
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);
        let corrected_momentum = momentum.affine(1.0 / bias_correction1, 0.0)?;
        let denominator = variance
            .affine(1.0 / bias_correction2, 0.0)?
            .sqrt()?
            .affine(1.0, self.epsilon)?;
        let update = corrected_momentum.div(&denominator)?;

        // θ_t = θ_{t-1} * (1 - α λ) - α * m̂_t / (√v̂_t + ε)
        let decayed = var.as_tensor().affine(1.0 - self.learning_rate * self.weight_decay, 0.0)?;
        var.set(&decayed.sub(&update.affine(self.learning_rate, 0.0)?)?)?;

        self.momentum.insert(name.to_string(), momentum);
        self.variance.insert(name.to_string(), variance);
        Ok(())
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        "adamw"
    }

    fn step(&mut self, gradients: &GradStore) -> candle_core::Result<()> {
        self.step_count += 1;

        let vars = self.vars.clone();
        for (name, var) in &vars {
            if let Some(grad) = gradients.get(var) {
                self.update_parameter(name, var, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_tensors(&self) -> HashMap<String, Tensor> {
        let momentum = self
            .momentum
            .iter()
            .map(|(name, t)| (format!("{}{}", MOMENTUM_PREFIX, name), t.clone()));
        let variance = self
            .variance
            .iter()
            .map(|(name, t)| (format!("{}{}", VARIANCE_PREFIX, name), t.clone()));
        momentum.chain(variance).collect()
    }

    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>, step_count: usize) -> Result<()> {
        let mut momentum = HashMap::new();
        let mut variance = HashMap::new();

        for (name, var) in &self.vars {
            let m = tensors.get(&format!("{}{}", MOMENTUM_PREFIX, name));
            let v = tensors.get(&format!("{}{}", VARIANCE_PREFIX, name));
            match (m, v) {
                (Some(m), Some(v)) => {
                    if m.shape() != var.shape() || v.shape() != var.shape() {
                        return Err(Error::checkpoint(format!("optimizer state shape mismatch for {}", name)));
                    }
                    momentum.insert(name.clone(), m.to_device(var.device())?);
                    variance.insert(name.clone(), v.to_device(var.device())?);
                }
                (None, None) => {}
                _ => {
                    return Err(Error::checkpoint(format!("incomplete optimizer state for {}", name)));
                }
            }
        }

        self.momentum = momentum;
        self.variance = variance;
        self.step_count = step_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn single_param(value: f32) -> VarMap {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        vb.get_with_hints(1, "w", Init::Const(value as f64)).unwrap();
        var_map
    }

    fn step_on(opt: &mut AdamWOptimizer, grad_scale: f32) {
        let var = opt.vars()[0].clone();
        // A tensor product keeps the node in the graph even for a zero scale
        let scale = Tensor::full(grad_scale, var.shape(), var.device()).unwrap();
        let loss = var.as_tensor().mul(&scale).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
    }

    fn value(var_map: &VarMap) -> f32 {
        var_map.all_vars()[0].as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // Bias-corrected first step is lr * g / (|g| + eps), i.e. about lr
        let var_map = single_param(1.0);
        let mut opt = AdamWOptimizer::new(&var_map, 0.1, 0.9, 0.999, 1e-8, 0.0).unwrap();
        step_on(&mut opt, 2.0);

        assert_relative_eq!(value(&var_map), 0.9, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_decoupled_weight_decay() {
        // Zero gradient: only decay applies
        let var_map = single_param(2.0);
        let mut opt = AdamWOptimizer::new(&var_map, 0.1, 0.9, 0.999, 1e-8, 0.5).unwrap();
        step_on(&mut opt, 0.0);

        assert_relative_eq!(value(&var_map), 2.0 * (1.0 - 0.1 * 0.5), epsilon = 1e-6);
    }

    #[test]
    fn test_state_round_trip() {
        let var_map = single_param(1.0);
        let mut opt = AdamWOptimizer::new(&var_map, 0.01, 0.9, 0.999, 1e-8, 0.0).unwrap();
        step_on(&mut opt, 1.0);
        step_on(&mut opt, -3.0);

        let state = opt.state_tensors();
        assert!(state.contains_key("m.w"));
        assert!(state.contains_key("v.w"));

        let mut restored = AdamWOptimizer::new(&var_map, 0.01, 0.9, 0.999, 1e-8, 0.0).unwrap();
        restored.load_state_tensors(&state, opt.step_count()).unwrap();
        assert_eq!(restored.step_count(), 2);
        assert_eq!(
            restored.state_tensors()["m.w"].to_vec1::<f32>().unwrap(),
            state["m.w"].to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_partial_state() {
        let var_map = single_param(1.0);
        let mut opt = AdamWOptimizer::new(&var_map, 0.01, 0.9, 0.999, 1e-8, 0.0).unwrap();
        let mut state = HashMap::new();
        state.insert("m.w".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        assert!(opt.load_state_tensors(&state, 1).is_err());
    }
}
