use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use cifar_model::Model;
use hex::encode as hex_encode;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    error::Result,
    metrics::{MetricTrends, TrainingState},
    optimizer::{OptimizerScalars, OptimizerState, SgdOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BEST_CHECKPOINT: &str = "ckpt.pth";

const HEADER_KEY: &str = "checkpoint";
const MODEL_PREFIX: &str = "model.";
const MOMENTUM_PREFIX: &str = "optimizer.momentum.";

/// Point in the epoch at which a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    /// After the training pass, before validation and the scheduler step.
    Train,
    /// After validation and the scheduler step.
    Epoch,
    /// Best validation accuracy so far, written before the scheduler step.
    Best,
}

/// JSON header stored in the safetensors metadata under `checkpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    pub stage: CheckpointStage,
    pub epoch: usize,
    pub best_acc: f64,
    pub optimizer: OptimizerScalars,
    pub scheduler: SchedulerState,
    pub trends: MetricTrends,
    #[serde(default)]
    pub good_epochs: Vec<usize>,
    pub config_sha256: String,
    pub created_unix_timestamp: u64,
}

impl CheckpointHeader {
    pub fn training_state(&self) -> TrainingState {
        TrainingState {
            epoch: self.epoch,
            best_acc: self.best_acc,
            trends: self.trends.clone(),
            good_epochs: self.good_epochs.clone(),
        }
    }
}

pub struct SaveRequest<'a> {
    pub path: &'a Path,
    pub stage: CheckpointStage,
    pub config: &'a TrainingConfig,
    pub model: &'a Model,
    pub optimizer: &'a SgdOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub state: &'a TrainingState,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub header: CheckpointHeader,
    pub model_tensors: HashMap<String, Tensor>,
    pub momentum: HashMap<String, Tensor>,
}

impl LoadedCheckpoint {
    pub fn optimizer_state(&self) -> OptimizerState {
        OptimizerState {
            scalars: self.header.optimizer,
            momentum: self.momentum.clone(),
        }
    }
}

pub fn train_checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("ckpt_epoch{epoch}.pth"))
}

pub fn epoch_checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("ckpt{epoch}.pth"))
}

pub fn best_checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(BEST_CHECKPOINT)
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointHeader> {
    if let Some(parent) = request.path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    let optimizer_state = request.optimizer.state()?;
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in request.model.state_tensors()? {
        tensors.insert(format!("{MODEL_PREFIX}{name}"), tensor);
    }
    for (name, tensor) in optimizer_state.momentum {
        tensors.insert(format!("{MOMENTUM_PREFIX}{name}"), tensor);
    }

    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        stage: request.stage,
        epoch: request.state.epoch,
        best_acc: request.state.best_acc,
        optimizer: optimizer_state.scalars,
        scheduler: request.scheduler.state(),
        trends: request.state.trends.clone(),
        good_epochs: request.state.good_epochs.clone(),
        config_sha256: fingerprint_config(request.config)?,
        created_unix_timestamp: unix_timestamp(),
    };
    let metadata = HashMap::from([(HEADER_KEY.to_string(), serde_json::to_string(&header)?)]);

    // write beside the target and rename so readers never see a partial file
    let tmp_path = request.path.with_extension("pth.tmp");
    safetensors::serialize_to_file(&tensors, &Some(metadata), &tmp_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize checkpoint to {}: {err}",
            tmp_path.display()
        ))
    })?;
    fs::rename(&tmp_path, request.path)?;

    debug!(
        path = %request.path.display(),
        stage = ?request.stage,
        epoch = header.epoch,
        "checkpoint written"
    );
    Ok(header)
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    let bytes = fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(|err| {
        TrainingError::runtime(format!(
            "{} is not a safetensors checkpoint: {err}",
            path.display()
        ))
    })?;
    let raw_header = metadata
        .metadata()
        .as_ref()
        .and_then(|entries| entries.get(HEADER_KEY))
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint {} has no '{HEADER_KEY}' header",
                path.display()
            ))
        })?;
    let header: CheckpointHeader = serde_json::from_str(raw_header).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to parse checkpoint header in {}: {err}",
            path.display()
        ))
    })?;
    ensure_version_supported(header.version)?;

    let mut model_tensors = HashMap::new();
    let mut momentum = HashMap::new();
    for (name, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
        if let Some(param) = name.strip_prefix(MOMENTUM_PREFIX) {
            momentum.insert(param.to_string(), tensor);
        } else if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
            model_tensors.insert(param.to_string(), tensor);
        } else {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} contains unexpected tensor '{name}'",
                path.display()
            )));
        }
    }

    Ok(LoadedCheckpoint {
        path: path.to_path_buf(),
        header,
        model_tensors,
        momentum,
    })
}

/// `ckpt{N}.pth` files in `dir`, ascending by epoch.
pub fn list_epoch_checkpoints(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(epoch) = parse_epoch(&name.to_string_lossy(), "ckpt") {
            found.push((epoch, entry.path()));
        }
    }
    found.sort_by_key(|(epoch, _)| *epoch);
    Ok(found)
}

pub fn latest_epoch_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_epoch_checkpoints(dir)?.pop().map(|(_, path)| path))
}

/// Keeps the per-epoch files of the newest `max_keep` epochs; `ckpt.pth` is never pruned.
pub fn prune_checkpoints(dir: &Path, max_keep: Option<usize>) -> Result<()> {
    let Some(limit) = max_keep.filter(|&limit| limit > 0) else {
        return Ok(());
    };
    let epochs = list_epoch_checkpoints(dir)?;
    if epochs.len() <= limit {
        return Ok(());
    }
    for (epoch, path) in &epochs[..epochs.len() - limit] {
        fs::remove_file(path)?;
        let train_path = train_checkpoint_path(dir, *epoch);
        if train_path.is_file() {
            fs::remove_file(&train_path)?;
        }
        debug!(epoch = *epoch, "pruned checkpoint");
    }
    Ok(())
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String> {
    let json = serde_json::to_vec(config)?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn parse_epoch(file_name: &str, prefix: &str) -> Option<usize> {
    file_name
        .strip_prefix(prefix)?
        .strip_suffix(".pth")?
        .parse()
        .ok()
}

fn ensure_version_supported(version: u32) -> Result<()> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimizer::{GradientClipping, SgdConfig},
        scheduler::SchedulerConfig,
    };
    use cifar_model::{ModelConfig, ModelVariant};

    fn tiny_model() -> Model {
        Model::new(ModelConfig::for_variant(ModelVariant::Tiny, Device::Cpu)).unwrap()
    }

    #[test]
    fn epoch_names_parse() {
        assert_eq!(parse_epoch("ckpt12.pth", "ckpt"), Some(12));
        assert_eq!(parse_epoch("ckpt.pth", "ckpt"), None);
        assert_eq!(parse_epoch("ckpt_epoch3.pth", "ckpt"), None);
        assert_eq!(parse_epoch("ckpt_epoch3.pth", "ckpt_epoch"), Some(3));
    }

    #[test]
    fn header_and_tensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::default();
        let model = tiny_model();
        let optimizer = SgdOptimizer::new(
            model.trainable_parameters().unwrap(),
            SgdConfig::from(&config.optimizer),
            GradientClipping::default(),
        )
        .unwrap();
        let mut scheduler = SchedulerConfig::from_training_config(&config.scheduler, 0.1, 10)
            .unwrap()
            .build();
        scheduler.step();
        let mut state = TrainingState {
            epoch: 3,
            best_acc: 42.5,
            ..TrainingState::default()
        };
        state.trends.train_loss.push(2.3);
        // values whose shortest decimal form needs all 17 digits
        state.trends.valid_loss.push(11.386609077453613);
        state.trends.learning_rate.push(0.09755282581475769);
        state.trends.train_acc.push(1.0 / 3.0);

        let path = epoch_checkpoint_path(dir.path(), 3);
        save_checkpoint(SaveRequest {
            path: &path,
            stage: CheckpointStage::Epoch,
            config: &config,
            model: &model,
            optimizer: &optimizer,
            scheduler: scheduler.as_ref(),
            state: &state,
        })
        .unwrap();

        let loaded = load_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.header.stage, CheckpointStage::Epoch);
        assert_eq!(loaded.header.training_state(), state);
        assert_eq!(loaded.header.scheduler, scheduler.state());
        assert_eq!(
            loaded.header.config_sha256,
            fingerprint_config(&config).unwrap()
        );
        assert!(loaded.momentum.is_empty());
        assert_eq!(
            loaded.model_tensors.len(),
            model.parameters().unwrap().len()
        );
        model.load_state_tensors(loaded.model_tensors).unwrap();
    }

    #[test]
    fn latest_and_prune_follow_epoch_numbers() {
        let dir = tempfile::tempdir().unwrap();
        for epoch in [1, 2, 10] {
            fs::write(epoch_checkpoint_path(dir.path(), epoch), b"x").unwrap();
            fs::write(train_checkpoint_path(dir.path(), epoch), b"x").unwrap();
        }
        fs::write(best_checkpoint_path(dir.path()), b"x").unwrap();

        assert_eq!(
            latest_epoch_checkpoint(dir.path()).unwrap(),
            Some(epoch_checkpoint_path(dir.path(), 10))
        );

        prune_checkpoints(dir.path(), Some(1)).unwrap();
        let remaining: Vec<usize> = list_epoch_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        assert_eq!(remaining, vec![10]);
        assert!(!train_checkpoint_path(dir.path(), 2).exists());
        assert!(best_checkpoint_path(dir.path()).exists());
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt1.pth");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(load_checkpoint(&path, &Device::Cpu).is_err());
    }
}
