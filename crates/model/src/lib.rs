pub mod block;
pub mod config;
pub mod model;

pub use block::ResidualBlock;
pub use config::{BlockKind, ModelConfig, ModelVariant, IMAGE_CHANNELS, IMAGE_SIZE, NUM_CLASSES};
pub use model::{is_running_statistic, Model};
