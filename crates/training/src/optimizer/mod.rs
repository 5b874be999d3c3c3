use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::Result, TrainingError};

const EPS: f64 = 1e-12;

/// Hyperparameters of momentum SGD with coupled (L2) weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl From<&config::OptimizerConfig> for SgdConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            momentum: value.momentum,
            dampening: value.dampening,
            weight_decay: value.weight_decay,
            nesterov: value.nesterov,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GradientClipping {
    /// Clamp each gradient element to `[-value, value]`.
    pub value: Option<f64>,
    /// Rescale all gradients so their joint L2 norm is at most this.
    pub max_norm: Option<f64>,
}

impl From<&config::OptimizerConfig> for GradientClipping {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            value: value.grad_clip_value,
            max_norm: value.max_grad_norm,
        }
    }
}

#[derive(Debug)]
pub struct SgdOptimizer {
    config: SgdConfig,
    clipping: GradientClipping,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    momentum_buffer: Option<Tensor>,
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    pub learning_rate: f64,
    /// Gradient L2 norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
}

impl SgdOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: SgdConfig,
        clipping: GradientClipping,
    ) -> Result<Self> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(TrainingError::initialization(
                "nesterov momentum requires momentum > 0 and zero dampening",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if !var.as_tensor().dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            params.push(ParameterSlot {
                name,
                param: var,
                momentum_buffer: None,
            });
        }

        Ok(Self {
            config,
            clipping,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> SgdConfig {
        self.config
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Applies one update from the gradients in `grads`, consuming them.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<StepReport> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                processed.push((index, grad.to_dtype(DType::F32)?));
            }
        }

        let mut report = StepReport {
            learning_rate: self.config.learning_rate,
            grad_norm: 0.0,
            clipped: false,
        };
        if processed.is_empty() {
            return Ok(report);
        }

        report.grad_norm = global_norm(processed.iter().map(|(_, grad)| grad))?;

        let mut norm = report.grad_norm;
        if let Some(limit) = self.clipping.value {
            for (_, grad) in processed.iter_mut() {
                *grad = grad.clamp(-limit, limit)?;
            }
            norm = global_norm(processed.iter().map(|(_, grad)| grad))?;
            report.clipped = norm < report.grad_norm;
        }

        if let Some(max_norm) = self.clipping.max_norm {
            if norm > max_norm {
                let scale = max_norm / (norm + EPS);
                for (_, grad) in processed.iter_mut() {
                    *grad = grad.affine(scale, 0.0)?;
                }
                report.clipped = true;
            }
        }

        self.step += 1;
        let cfg = self.config;
        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let dtype = slot.param.as_tensor().dtype();
            let current = slot.param.as_tensor().detach().to_dtype(DType::F32)?;

            let mut direction = if cfg.weight_decay != 0.0 {
                (grad + current.affine(cfg.weight_decay, 0.0)?)?
            } else {
                grad
            };

            if cfg.momentum != 0.0 {
                let buffer = match slot.momentum_buffer.take() {
                    Some(previous) => {
                        (previous.affine(cfg.momentum, 0.0)?
                            + direction.affine(1.0 - cfg.dampening, 0.0)?)?
                    }
                    None => direction.clone(),
                };
                direction = if cfg.nesterov {
                    (direction + buffer.affine(cfg.momentum, 0.0)?)?
                } else {
                    buffer.clone()
                };
                slot.momentum_buffer = Some(buffer);
            }

            let next = (current - direction.affine(cfg.learning_rate, 0.0)?)?;
            slot.param.set(&next.to_dtype(dtype)?)?;
        }

        Ok(report)
    }

    pub fn state(&self) -> Result<OptimizerState> {
        let mut momentum = HashMap::new();
        for slot in &self.params {
            if let Some(buffer) = &slot.momentum_buffer {
                momentum.insert(slot.name.clone(), buffer.copy()?);
            }
        }
        Ok(OptimizerState {
            scalars: OptimizerScalars {
                step: self.step,
                config: self.config,
            },
            momentum,
        })
    }

    /// Restores step counter, hyperparameters and momentum buffers.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let OptimizerState {
            scalars,
            mut momentum,
        } = state;

        for slot in &mut self.params {
            slot.momentum_buffer = match momentum.remove(&slot.name) {
                Some(buffer) => {
                    let expected = slot.param.as_tensor();
                    if buffer.dims() != expected.dims() {
                        return Err(TrainingError::runtime(format!(
                            "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                            slot.name,
                            expected.dims(),
                            buffer.dims()
                        )));
                    }
                    Some(buffer.to_dtype(DType::F32)?.to_device(expected.device())?)
                }
                None if scalars.step > 0 && scalars.config.momentum != 0.0 => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing momentum buffer for '{}'",
                        slot.name
                    )));
                }
                None => None,
            };
        }

        if !momentum.is_empty() {
            let mut extra: Vec<_> = momentum.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        self.step = scalars.step;
        self.config = scalars.config;
        Ok(())
    }
}

fn global_norm<'a>(grads: impl Iterator<Item = &'a Tensor>) -> Result<f64> {
    let mut total = 0f64;
    for grad in grads {
        total += grad.sqr()?.sum_all()?.to_vec0::<f32>()? as f64;
    }
    Ok(total.sqrt())
}

/// Scalar optimizer state stored in the checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerScalars {
    pub step: usize,
    pub config: SgdConfig,
}

#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub scalars: OptimizerScalars,
    /// Momentum buffers keyed by parameter name; absent before the first step.
    pub momentum: HashMap<String, Tensor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_param(value: f32) -> (String, Var) {
        let var = Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap();
        ("w".to_string(), var)
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    fn grads_for(var: &Var, grad: f32) -> GradStore {
        // d/dw (grad * w) = grad
        let loss = (var.as_tensor() * grad as f64).unwrap().sum_all().unwrap();
        loss.backward().unwrap()
    }

    fn sgd(momentum: f64, weight_decay: f64, nesterov: bool) -> SgdConfig {
        SgdConfig {
            learning_rate: 0.1,
            momentum,
            dampening: 0.0,
            weight_decay,
            nesterov,
        }
    }

    #[test]
    fn plain_sgd_follows_gradient() {
        let (name, var) = scalar_param(1.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.0, 0.0, false),
            GradientClipping::default(),
        )
        .unwrap();
        let report = opt.step(&mut grads_for(&var, 2.0)).unwrap();
        assert!((value(&var) - 0.8).abs() < 1e-6);
        assert!((report.grad_norm - 2.0).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let (name, var) = scalar_param(1.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.9, 0.0, false),
            GradientClipping::default(),
        )
        .unwrap();
        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        assert!((value(&var) - 0.9).abs() < 1e-6);
        // buffer = 0.9 * 1 + 1 = 1.9
        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        assert!((value(&var) - 0.71).abs() < 1e-6);
        assert_eq!(opt.step_count(), 2);
    }

    #[test]
    fn weight_decay_is_added_to_gradient() {
        let (name, var) = scalar_param(2.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.0, 0.5, false),
            GradientClipping::default(),
        )
        .unwrap();
        // grad 1 + 0.5 * 2 = 2
        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        assert!((value(&var) - 1.8).abs() < 1e-6);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let (name, var) = scalar_param(1.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.5, 0.0, true),
            GradientClipping::default(),
        )
        .unwrap();
        // buffer = 1, direction = 1 + 0.5 * 1
        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        assert!((value(&var) - 0.85).abs() < 1e-6);
    }

    #[test]
    fn clipping_bounds_update() {
        let (name, var) = scalar_param(0.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.0, 0.0, false),
            GradientClipping {
                value: Some(0.5),
                max_norm: None,
            },
        )
        .unwrap();
        let report = opt.step(&mut grads_for(&var, 10.0)).unwrap();
        assert!(report.clipped);
        assert!((value(&var) + 0.05).abs() < 1e-6);
    }

    #[test]
    fn small_gradient_is_not_reported_clipped() {
        let (name, var) = scalar_param(0.0);
        let mut opt = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.0, 0.0, false),
            GradientClipping {
                value: Some(0.5),
                max_norm: Some(1.0),
            },
        )
        .unwrap();
        let report = opt.step(&mut grads_for(&var, 0.25)).unwrap();
        assert!(!report.clipped);
        assert!((value(&var) + 0.025).abs() < 1e-6);
    }

    #[test]
    fn state_round_trip_restores_buffers() {
        let (name, var) = scalar_param(1.0);
        let mut opt = SgdOptimizer::new(
            vec![(name.clone(), var.clone())],
            sgd(0.9, 0.0, false),
            GradientClipping::default(),
        )
        .unwrap();
        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        let state = opt.state().unwrap();

        let mut restored = SgdOptimizer::new(
            vec![(name, var.clone())],
            sgd(0.9, 0.0, false),
            GradientClipping::default(),
        )
        .unwrap();
        restored.set_learning_rate(0.5);
        restored.load_state(state).unwrap();
        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.learning_rate(), 0.1);

        opt.step(&mut grads_for(&var, 1.0)).unwrap();
        let after_original = value(&var);
        var.set(&Tensor::new(&[0.9f32], &Device::Cpu).unwrap()).unwrap();
        restored.step(&mut grads_for(&var, 1.0)).unwrap();
        assert!((value(&var) - after_original).abs() < 1e-6);
    }

    #[test]
    fn foreign_state_is_rejected() {
        let (_, var) = scalar_param(1.0);
        let mut opt = SgdOptimizer::new(
            vec![("w".into(), var)],
            sgd(0.9, 0.0, false),
            GradientClipping::default(),
        )
        .unwrap();
        let mut momentum = HashMap::new();
        momentum.insert("w".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        let state = OptimizerState {
            scalars: OptimizerScalars {
                step: 1,
                config: sgd(0.9, 0.0, false),
            },
            momentum,
        };
        assert!(opt.load_state(state).is_err());
    }
}
