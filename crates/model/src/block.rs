use std::fmt;

use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module,
    ModuleT, VarBuilder,
};

use crate::config::BlockKind;

/// Convolution followed by batch normalisation, the unit every block is built from.
pub(crate) struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: kernel / 2,
            stride,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    pub(crate) fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.bn.forward_t(&xs, train)
    }
}

/// Two 3x3 convolutions with an identity or projected shortcut.
pub struct BasicBlock {
    conv1: ConvBn,
    conv2: ConvBn,
    shortcut: Option<ConvBn>,
}

impl BasicBlock {
    fn new(in_channels: usize, width: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = ConvBn::new(in_channels, width, 3, stride, vb.pp("conv1"))?;
        let conv2 = ConvBn::new(width, width, 3, 1, vb.pp("conv2"))?;
        let shortcut = if stride != 1 || in_channels != width {
            Some(ConvBn::new(in_channels, width, 1, stride, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            shortcut,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.conv1.forward_t(xs, train)?.relu()?;
        let out = self.conv2.forward_t(&out, train)?;
        let residual = match &self.shortcut {
            Some(projection) => projection.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (out + residual)?.relu()
    }
}

/// 1x1 reduce, 3x3, 1x1 expand (x4) block used by the deeper variants.
pub struct Bottleneck {
    reduce: ConvBn,
    conv: ConvBn,
    expand: ConvBn,
    shortcut: Option<ConvBn>,
}

impl Bottleneck {
    fn new(in_channels: usize, width: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let out_channels = width * BlockKind::Bottleneck.expansion();
        let reduce = ConvBn::new(in_channels, width, 1, 1, vb.pp("conv1"))?;
        let conv = ConvBn::new(width, width, 3, stride, vb.pp("conv2"))?;
        let expand = ConvBn::new(width, out_channels, 1, 1, vb.pp("conv3"))?;
        let shortcut = if stride != 1 || in_channels != out_channels {
            Some(ConvBn::new(in_channels, out_channels, 1, stride, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            reduce,
            conv,
            expand,
            shortcut,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.reduce.forward_t(xs, train)?.relu()?;
        let out = self.conv.forward_t(&out, train)?.relu()?;
        let out = self.expand.forward_t(&out, train)?;
        let residual = match &self.shortcut {
            Some(projection) => projection.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (out + residual)?.relu()
    }
}

pub enum ResidualBlock {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidualBlock::Basic(block) => f
                .debug_struct("BasicBlock")
                .field("projected", &block.shortcut.is_some())
                .finish(),
            ResidualBlock::Bottleneck(block) => f
                .debug_struct("Bottleneck")
                .field("projected", &block.shortcut.is_some())
                .finish(),
        }
    }
}

impl ResidualBlock {
    /// Builds one block; `in_channels` is the width produced by the previous block.
    pub fn new(
        kind: BlockKind,
        in_channels: usize,
        width: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            BlockKind::Basic => Ok(Self::Basic(BasicBlock::new(in_channels, width, stride, vb)?)),
            BlockKind::Bottleneck => Ok(Self::Bottleneck(Bottleneck::new(
                in_channels,
                width,
                stride,
                vb,
            )?)),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            ResidualBlock::Basic(block) => block.forward_t(xs, train),
            ResidualBlock::Bottleneck(block) => block.forward_t(xs, train),
        }
    }
}
