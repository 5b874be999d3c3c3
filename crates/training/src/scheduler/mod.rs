use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{
    config::{self, LearningRateSchedule},
    error::Result,
    TrainingError,
};

/// Epoch-based learning-rate schedule. `step` is called once per completed epoch.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Serializable scheduler position stored in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub strategy: LearningRateSchedule,
    pub base_lr: f64,
    pub last_epoch: usize,
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    CosineAnnealing {
        base_lr: f64,
        t_max: usize,
        min_lr: f64,
    },
    Constant {
        base_lr: f64,
    },
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_epochs: usize,
    ) -> Result<Self> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        match cfg.strategy {
            LearningRateSchedule::CosineAnnealing => {
                let t_max = cfg.t_max.unwrap_or(total_epochs);
                if t_max == 0 {
                    return Err(TrainingError::initialization(
                        "cosine annealing requires t_max greater than zero",
                    ));
                }
                if cfg.min_lr < 0.0 || cfg.min_lr > base_lr {
                    return Err(TrainingError::initialization(
                        "scheduler min_lr must be in [0, base_lr]",
                    ));
                }
                Ok(SchedulerConfig::CosineAnnealing {
                    base_lr,
                    t_max,
                    min_lr: cfg.min_lr,
                })
            }
            LearningRateSchedule::Constant => Ok(SchedulerConfig::Constant { base_lr }),
            LearningRateSchedule::Step => {
                let step_size = cfg.step_size.filter(|&size| size > 0).ok_or_else(|| {
                    TrainingError::initialization("step schedule requires step_size > 0")
                })?;
                Ok(SchedulerConfig::Step {
                    base_lr,
                    step_size,
                    gamma: cfg.gamma,
                })
            }
        }
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        match self {
            SchedulerConfig::CosineAnnealing {
                base_lr,
                t_max,
                min_lr,
            } => Box::new(CosineAnnealing {
                base_lr,
                min_lr,
                t_max,
                epoch: 0,
            }),
            SchedulerConfig::Constant { base_lr } => Box::new(ConstantLr { base_lr, epoch: 0 }),
            SchedulerConfig::Step {
                base_lr,
                step_size,
                gamma,
            } => Box::new(StepDecay {
                base_lr,
                step_size,
                gamma,
                epoch: 0,
            }),
        }
    }
}

/// `min + (base - min) * (1 + cos(pi * epoch / t_max)) / 2`, evaluated in closed form.
struct CosineAnnealing {
    base_lr: f64,
    min_lr: f64,
    t_max: usize,
    epoch: usize,
}

impl CosineAnnealing {
    fn compute_lr(&self, epoch: usize) -> f64 {
        let progress = epoch as f64 / self.t_max as f64;
        self.min_lr + (self.base_lr - self.min_lr) * 0.5 * (1.0 + f64::cos(PI * progress))
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.compute_lr(self.epoch)
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.epoch)
    }

    fn state(&self) -> SchedulerState {
        snapshot(
            LearningRateSchedule::CosineAnnealing,
            self.base_lr,
            self.epoch,
            self.learning_rate(),
        )
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        self.epoch = restore(LearningRateSchedule::CosineAnnealing, state)?;
        self.base_lr = state.base_lr;
        Ok(())
    }
}

struct ConstantLr {
    base_lr: f64,
    epoch: usize,
}

impl LRScheduler for ConstantLr {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.base_lr
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn state(&self) -> SchedulerState {
        snapshot(
            LearningRateSchedule::Constant,
            self.base_lr,
            self.epoch,
            self.base_lr,
        )
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        self.epoch = restore(LearningRateSchedule::Constant, state)?;
        self.base_lr = state.base_lr;
        Ok(())
    }
}

/// Multiplies the rate by `gamma` every `step_size` epochs.
struct StepDecay {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepDecay {
    fn compute_lr(&self, epoch: usize) -> f64 {
        self.base_lr * self.gamma.powi((epoch / self.step_size) as i32)
    }
}

impl LRScheduler for StepDecay {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.compute_lr(self.epoch)
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.epoch)
    }

    fn state(&self) -> SchedulerState {
        snapshot(
            LearningRateSchedule::Step,
            self.base_lr,
            self.epoch,
            self.learning_rate(),
        )
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        self.epoch = restore(LearningRateSchedule::Step, state)?;
        self.base_lr = state.base_lr;
        Ok(())
    }
}

fn snapshot(
    strategy: LearningRateSchedule,
    base_lr: f64,
    last_epoch: usize,
    learning_rate: f64,
) -> SchedulerState {
    SchedulerState {
        strategy,
        base_lr,
        last_epoch,
        learning_rate,
    }
}

fn restore(expected: LearningRateSchedule, state: &SchedulerState) -> Result<usize> {
    if state.strategy != expected {
        return Err(TrainingError::runtime(format!(
            "checkpoint scheduler is {:?} but the run is configured for {:?}",
            state.strategy, expected
        )));
    }
    if state.base_lr <= 0.0 {
        return Err(TrainingError::runtime(
            "checkpoint scheduler has a non-positive base learning rate",
        ));
    }
    Ok(state.last_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(base_lr: f64, t_max: usize) -> Box<dyn LRScheduler> {
        SchedulerConfig::CosineAnnealing {
            base_lr,
            t_max,
            min_lr: 0.0,
        }
        .build()
    }

    #[test]
    fn cosine_reaches_half_and_zero() {
        let mut scheduler = cosine(0.1, 4);
        assert!((scheduler.learning_rate() - 0.1).abs() < 1e-12);
        scheduler.step();
        let half = scheduler.step();
        assert!((half - 0.05).abs() < 1e-12);
        scheduler.step();
        let end = scheduler.step();
        assert!(end.abs() < 1e-12);
    }

    #[test]
    fn cosine_is_monotone_within_period() {
        let mut scheduler = cosine(0.1, 200);
        let mut previous = scheduler.learning_rate();
        for _ in 0..200 {
            let lr = scheduler.step();
            assert!(lr <= previous + 1e-15);
            previous = lr;
        }
    }

    #[test]
    fn state_restores_position() {
        let mut scheduler = cosine(0.1, 10);
        for _ in 0..3 {
            scheduler.step();
        }
        let state = scheduler.state();

        let mut resumed = cosine(0.1, 10);
        resumed.load_state(&state).unwrap();
        assert_eq!(resumed.learning_rate(), scheduler.learning_rate());
        assert_eq!(resumed.step(), scheduler.step());
    }

    #[test]
    fn state_from_other_strategy_is_rejected() {
        let constant = SchedulerConfig::Constant { base_lr: 0.1 }.build();
        let mut scheduler = cosine(0.1, 10);
        assert!(scheduler.load_state(&constant.state()).is_err());
    }

    #[test]
    fn step_decay_multiplies_by_gamma() {
        let mut scheduler = SchedulerConfig::Step {
            base_lr: 1.0,
            step_size: 2,
            gamma: 0.5,
        }
        .build();
        let rates: Vec<f64> = (0..4).map(|_| scheduler.step()).collect();
        assert_eq!(rates, vec![1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn t_max_defaults_to_epochs() {
        let cfg = config::SchedulerConfig::default();
        match SchedulerConfig::from_training_config(&cfg, 0.1, 30).unwrap() {
            SchedulerConfig::CosineAnnealing { t_max, .. } => assert_eq!(t_max, 30),
            other => panic!("unexpected scheduler {:?}", other),
        }
    }
}
