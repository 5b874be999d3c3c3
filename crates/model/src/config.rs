use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Error, Result};
use serde::{Deserialize, Serialize};

/// Input geometry shared by every variant.
pub const IMAGE_CHANNELS: usize = 3;
pub const IMAGE_SIZE: usize = 32;
pub const NUM_CLASSES: usize = 10;

/// Hardcoded network variants selectable at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet5m,
    Resnet5mDropout,
    Tiny,
}

impl Default for ModelVariant {
    fn default() -> Self {
        Self::Resnet5m
    }
}

impl ModelVariant {
    pub fn display_name(self) -> &'static str {
        match self {
            ModelVariant::Resnet18 => "ResNet18",
            ModelVariant::Resnet34 => "ResNet34",
            ModelVariant::Resnet50 => "ResNet50",
            ModelVariant::Resnet5m => "ResNet5M",
            ModelVariant::Resnet5mDropout => "ResNet5MWithDropout",
            ModelVariant::Tiny => "TinyResNet",
        }
    }

    /// Dropout applied before the classifier when the caller does not override it.
    pub fn default_dropout(self) -> Option<f32> {
        match self {
            ModelVariant::Resnet5mDropout => Some(0.2),
            _ => None,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ModelVariant {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "resnet18" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            "resnet50" => Ok(Self::Resnet50),
            "resnet5m" => Ok(Self::Resnet5m),
            "resnet5m_dropout" | "resnet5mwithdropout" => Ok(Self::Resnet5mDropout),
            "tiny" | "tinyresnet" => Ok(Self::Tiny),
            other => Err(Error::Msg(format!("unknown model variant '{other}'"))),
        }
    }
}

/// Residual block flavour used by every stage of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

/// Structural description of a ResNet-style classifier.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    pub block: BlockKind,
    pub stem_width: usize,
    pub stage_blocks: Vec<usize>,
    pub stage_widths: Vec<usize>,
    pub num_classes: usize,
    pub dropout_p: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn for_variant(variant: ModelVariant, device: Device) -> Self {
        let (block, stem_width, stage_blocks, stage_widths) = match variant {
            ModelVariant::Resnet18 => (BlockKind::Basic, 64, vec![2, 2, 2, 2], vec![64, 128, 256, 512]),
            ModelVariant::Resnet34 => (BlockKind::Basic, 64, vec![3, 4, 6, 3], vec![64, 128, 256, 512]),
            ModelVariant::Resnet50 => (
                BlockKind::Bottleneck,
                64,
                vec![3, 4, 6, 3],
                vec![64, 128, 256, 512],
            ),
            ModelVariant::Resnet5m | ModelVariant::Resnet5mDropout => {
                (BlockKind::Basic, 64, vec![2, 2, 2, 2], vec![64, 128, 256, 256])
            }
            ModelVariant::Tiny => (BlockKind::Basic, 8, vec![1, 1], vec![8, 16]),
        };

        Self {
            variant,
            block,
            stem_width,
            stage_blocks,
            stage_widths,
            num_classes: NUM_CLASSES,
            dropout_p: variant.default_dropout(),
            dtype: DType::F32,
            device,
        }
    }

    pub fn with_dropout(mut self, dropout_p: Option<f32>) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    /// Channel count entering the classifier head.
    pub fn feature_width(&self) -> usize {
        self.stage_widths.last().copied().unwrap_or(self.stem_width) * self.block.expansion()
    }

    pub fn validate(&self) -> Result<()> {
        if self.stem_width == 0 {
            return Err(Error::Msg("stem_width must be greater than zero".into()));
        }
        if self.stage_blocks.is_empty() {
            return Err(Error::Msg("at least one stage is required".into()));
        }
        if self.stage_blocks.len() != self.stage_widths.len() {
            return Err(Error::Msg(format!(
                "stage_blocks ({}) and stage_widths ({}) must have the same length",
                self.stage_blocks.len(),
                self.stage_widths.len()
            )));
        }
        if self.stage_blocks.iter().any(|&n| n == 0) {
            return Err(Error::Msg("every stage needs at least one block".into()));
        }
        if self.stage_widths.iter().any(|&w| w == 0) {
            return Err(Error::Msg("stage widths must be greater than zero".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model parameters must be floating point, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_parse_back() {
        for variant in [
            ModelVariant::Resnet18,
            ModelVariant::Resnet34,
            ModelVariant::Resnet50,
            ModelVariant::Resnet5m,
            ModelVariant::Resnet5mDropout,
            ModelVariant::Tiny,
        ] {
            let parsed: ModelVariant = variant.display_name().parse().unwrap();
            assert_eq!(parsed, variant);
        }
        assert!("vgg16".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn mismatched_stages_are_rejected() {
        let mut config = ModelConfig::for_variant(ModelVariant::Tiny, Device::Cpu);
        config.stage_widths.push(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bottleneck_feature_width_includes_expansion() {
        let config = ModelConfig::for_variant(ModelVariant::Resnet50, Device::Cpu);
        assert_eq!(config.feature_width(), 2048);
    }
}
