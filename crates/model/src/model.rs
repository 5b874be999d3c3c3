use std::{cell::Cell, collections::HashMap, path::Path};

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};

use crate::{
    block::{ConvBn, ResidualBlock},
    config::{ModelConfig, IMAGE_CHANNELS, IMAGE_SIZE},
};

const RUNNING_STAT_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

/// ResNet-style CIFAR-10 classifier whose parameters live in a [`VarMap`].
pub struct Model {
    config: ModelConfig,
    varmap: VarMap,
    stem: ConvBn,
    stages: Vec<Vec<ResidualBlock>>,
    head: Linear,
    training: Cell<bool>,
}

impl Model {
    /// Builds the network described by `config` with freshly initialised weights.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let stem = ConvBn::new(IMAGE_CHANNELS, config.stem_width, 3, 1, vb.pp("stem"))?;

        let expansion = config.block.expansion();
        let mut in_channels = config.stem_width;
        let mut stages = Vec::with_capacity(config.stage_blocks.len());
        for (stage_idx, (&blocks, &width)) in config
            .stage_blocks
            .iter()
            .zip(config.stage_widths.iter())
            .enumerate()
        {
            let stage_vb = vb.pp(format!("layer{}", stage_idx + 1));
            let mut stage = Vec::with_capacity(blocks);
            for block_idx in 0..blocks {
                let stride = if stage_idx > 0 && block_idx == 0 { 2 } else { 1 };
                stage.push(ResidualBlock::new(
                    config.block,
                    in_channels,
                    width,
                    stride,
                    stage_vb.pp(block_idx.to_string()),
                )?);
                in_channels = width * expansion;
            }
            stages.push(stage);
        }

        let head = linear(config.feature_width(), config.num_classes, vb.pp("fc"))?;

        Ok(Self {
            config,
            varmap,
            stem,
            stages,
            head,
            training: Cell::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Maps images shaped `(batch, 3, 32, 32)` to logits shaped `(batch, num_classes)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let dims = images.dims();
        if dims.len() != 4 || dims[1] != IMAGE_CHANNELS {
            return Err(Error::Msg(format!(
                "expected images shaped [batch, {IMAGE_CHANNELS}, {IMAGE_SIZE}, {IMAGE_SIZE}], got {:?}",
                dims
            )));
        }
        let train = self.is_training();

        let mut hidden = self.stem.forward_t(images, train)?.relu()?;
        for stage in &self.stages {
            for block in stage {
                hidden = block.forward_t(&hidden, train)?;
            }
        }

        // global average pool over the spatial dims
        let pooled = hidden.flatten_from(2)?.mean(2)?;
        let pooled = match self.config.dropout_p {
            Some(p) if train && p > 0.0 => ops::dropout(&pooled, p)?,
            _ => pooled,
        };
        self.head.forward(&pooled)
    }

    /// Every registered variable, batch-norm running statistics included, sorted by name.
    pub fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("parameter registry lock poisoned".into()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Variables updated by the optimizer; running statistics are excluded.
    pub fn trainable_parameters(&self) -> Result<Vec<(String, Var)>> {
        Ok(self
            .parameters()?
            .into_iter()
            .filter(|(name, _)| !is_running_statistic(name))
            .collect())
    }

    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .trainable_parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }

    /// Detached copies of every variable keyed by name.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let named = self.parameters()?;
        let mut tensors = HashMap::with_capacity(named.len());
        for (name, var) in named {
            tensors.insert(name, var.as_tensor().copy()?);
        }
        Ok(tensors)
    }

    /// Overwrites every variable from `tensors`. Missing, unknown or mis-shaped entries are errors.
    pub fn load_state_tensors(&self, mut tensors: HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.parameters()? {
            let tensor = tensors
                .remove(&name)
                .ok_or_else(|| Error::Msg(format!("state is missing parameter {name}")))?;
            let expected = var.as_tensor();
            if tensor.dims() != expected.dims() {
                return Err(Error::Msg(format!(
                    "shape mismatch for {name}: expected {:?}, found {:?}",
                    expected.dims(),
                    tensor.dims()
                )));
            }
            let tensor = tensor
                .to_dtype(expected.dtype())?
                .to_device(expected.device())?;
            var.set(&tensor)?;
        }

        if !tensors.is_empty() {
            let mut extra: Vec<_> = tensors.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "state contains unknown parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self.state_tensors()?;
        candle_core::safetensors::save(&tensors, path.as_ref())
    }

    pub fn load_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &self.config.device)?;
        self.load_state_tensors(tensors)
    }
}

pub fn is_running_statistic(name: &str) -> bool {
    RUNNING_STAT_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}
