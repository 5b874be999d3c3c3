use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::Result;
use crate::TrainingError;

/// Mean negative log-likelihood over a batch of class logits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `logits` is `(batch, classes)`, `targets` is `(batch,)` class ids.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (batch, classes) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy needs at least one sample and one class",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets shaped {:?} do not match {} logits rows",
                targets.dims(),
                batch
            )));
        }

        let targets = match targets.dtype() {
            DType::U32 => targets.to_device(logits.device())?,
            DType::U8 | DType::I64 => targets.to_dtype(DType::U32)?.to_device(logits.device())?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let loss = nll.mean_all()?;
        let average_loss = loss.to_dtype(DType::F32)?.to_vec0::<f32>()?;

        let correct = logits
            .argmax(D::Minus1)?
            .eq(&targets)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_vec0::<u32>()? as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    average_loss: f32,
    total: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    /// Fraction in [0, 1].
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let logits = Tensor::zeros((4, 10), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 3, 5, 9], &Device::Cpu).unwrap();
        let output = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        let expected = (10f32).ln();
        assert!((output.metrics.average_loss() - expected).abs() < 1e-5);
        assert_eq!(output.metrics.total(), 4);
    }

    #[test]
    fn counts_correct_predictions() {
        let logits = Tensor::new(
            &[[5f32, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 5.0]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[0u32, 1, 0], &Device::Cpu).unwrap();
        let metrics = CrossEntropyLoss::new()
            .compute(&logits, &targets)
            .unwrap()
            .metrics;
        assert_eq!(metrics.correct(), 2);
        assert!((metrics.accuracy() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_targets() {
        let logits = Tensor::zeros((2, 10), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
    }
}
