use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::loss::LossMetrics;

/// Append-only metric history persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricTrends {
    pub train_loss: Vec<f64>,
    /// Percent.
    pub train_acc: Vec<f64>,
    pub valid_loss: Vec<f64>,
    /// Percent.
    pub valid_acc: Vec<f64>,
    /// One entry per optimizer step.
    pub learning_rate: Vec<f64>,
}

impl MetricTrends {
    pub fn record_train(&mut self, stats: &EpochStats) {
        self.train_loss.push(stats.average_loss);
        self.train_acc.push(stats.accuracy);
    }

    pub fn record_valid(&mut self, stats: &EpochStats) {
        self.valid_loss.push(stats.average_loss);
        self.valid_acc.push(stats.accuracy);
    }

    pub fn record_learning_rate(&mut self, lr: f64) {
        self.learning_rate.push(lr);
    }

    pub fn epochs_recorded(&self) -> usize {
        self.train_loss.len()
    }
}

/// Everything the epoch loop carries from one epoch to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch; 0 before training starts.
    pub epoch: usize,
    /// Best validation accuracy seen so far, in percent.
    pub best_acc: f64,
    pub trends: MetricTrends,
    /// Epochs whose validation accuracy reached the reporting threshold.
    pub good_epochs: Vec<usize>,
}

/// Per-pass accumulator: loss is averaged per batch, accuracy per sample.
#[derive(Debug)]
pub struct EpochAccumulator {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    total: usize,
    started: Instant,
}

impl Default for EpochAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self {
            loss_sum: 0.0,
            batches: 0,
            correct: 0,
            total: 0,
            started: Instant::now(),
        }
    }

    pub fn update(&mut self, metrics: &LossMetrics) {
        self.loss_sum += metrics.average_loss() as f64;
        self.batches += 1;
        self.correct += metrics.correct();
        self.total += metrics.total();
    }

    pub fn running_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    pub fn running_accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }

    pub fn finish(self) -> EpochStats {
        EpochStats {
            average_loss: self.running_loss(),
            accuracy: self.running_accuracy(),
            correct: self.correct,
            total: self.total,
            batches: self.batches,
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochStats {
    pub average_loss: f64,
    /// Percent.
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::CrossEntropyLoss;
    use candle_core::{Device, Tensor};

    fn metrics(logits: &[[f32; 2]], targets: &[u32]) -> LossMetrics {
        let logits = Tensor::from_vec(logits.concat(), (logits.len(), 2), &Device::Cpu).unwrap();
        let targets = Tensor::new(targets, &Device::Cpu).unwrap();
        CrossEntropyLoss::new()
            .compute(&logits, &targets)
            .unwrap()
            .metrics
    }

    #[test]
    fn accuracy_is_weighted_by_samples() {
        let mut acc = EpochAccumulator::new();
        acc.update(&metrics(&[[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]], &[0, 0, 1]));
        acc.update(&metrics(&[[0.0, 1.0]], &[1]));
        let stats = acc.finish();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.correct, 3);
        assert_eq!(stats.batches, 2);
        assert!((stats.accuracy - 75.0).abs() < 1e-9);
    }

    #[test]
    fn empty_pass_reports_zero() {
        let stats = EpochAccumulator::new().finish();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_loss, 0.0);
        assert_eq!(stats.accuracy, 0.0);
    }

    #[test]
    fn trends_append_per_epoch() {
        let mut trends = MetricTrends::default();
        let mut acc = EpochAccumulator::new();
        acc.update(&metrics(&[[1.0, 0.0]], &[0]));
        let stats = acc.finish();
        trends.record_train(&stats);
        trends.record_valid(&stats);
        trends.record_learning_rate(0.1);
        assert_eq!(trends.epochs_recorded(), 1);
        assert_eq!(trends.valid_acc, vec![100.0]);
    }
}
