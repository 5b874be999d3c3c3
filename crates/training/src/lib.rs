pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod report;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointHeader, CheckpointStage, LoadedCheckpoint};
pub use config::{MilestoneAction, MilestoneConfig, TrainingConfig};
pub use data::{Cifar10, DataLoader, ImageBatch, ImageDataset};
pub use error::{Result, TrainingError};
pub use logging::MetricsLogger;
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{EpochStats, MetricTrends, TrainingState};
pub use optimizer::{GradientClipping, OptimizerState, SgdConfig, SgdOptimizer};
pub use report::{generate_predictions, write_predictions_csv, Prediction};
pub use scheduler::{LRScheduler, SchedulerConfig, SchedulerState};
pub use trainer::{EpochSummary, Trainer};
