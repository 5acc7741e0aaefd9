//! Small convolutional classifier built from EvoNorm blocks

use anyhow::Result;
use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

use super::normalization::{EvoNorm, EvoNormConfig, EvoNormVersion, NormMode};
use crate::error::NormResult;
use crate::trainer::Classifier;

/// 3x3 convolution followed by EvoNorm
#[derive(Module, Debug)]
pub struct EvoConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: EvoNorm<B>,
}

impl<B: Backend> EvoConvBlock<B> {
    pub fn new(
        in_channels: usize,
        norm: &EvoNormConfig,
        device: &B::Device,
    ) -> NormResult<Self> {
        // The normalization's beta replaces the convolution bias
        let conv = Conv2dConfig::new([in_channels, norm.num_features], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(false)
            .init(device);

        Ok(Self {
            conv,
            norm: norm.init(device)?,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> NormResult<Tensor<B, 4>> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// EvoNet configuration
#[derive(Config)]
pub struct EvoNetConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = 16)]
    pub hidden_channels: usize,
    /// Variant of the second block; the first block is always B0
    #[config(default = "EvoNormVersion::S0")]
    pub head_version: EvoNormVersion,
    #[config(default = 8)]
    pub num_groups: usize,
}

impl EvoNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NormResult<EvoNet<B>> {
        let norm = EvoNormConfig::new(self.hidden_channels).with_num_groups(self.num_groups);

        let stem = EvoConvBlock::new(
            self.in_channels,
            &norm.clone().with_version(EvoNormVersion::B0),
            device,
        )?;
        let head = EvoConvBlock::new(
            self.hidden_channels,
            &norm.with_version(self.head_version),
            device,
        )?;

        Ok(EvoNet {
            stem,
            head,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier: LinearConfig::new(self.hidden_channels, self.num_classes).init(device),
        })
    }
}

/// `conv -> EvoNorm-B0 -> conv -> EvoNorm -> global average pool -> linear`
#[derive(Module, Debug)]
pub struct EvoNet<B: Backend> {
    stem: EvoConvBlock<B>,
    head: EvoConvBlock<B>,
    pool: AdaptiveAvgPool2d,
    classifier: Linear<B>,
}

impl<B: Backend> EvoNet<B> {
    /// The EvoNorm layers in forward order
    pub fn norms(&self) -> Vec<&EvoNorm<B>> {
        vec![&self.stem.norm, &self.head.norm]
    }
}

impl<B: Backend> Classifier<B> for EvoNet<B> {
    fn forward(&self, inputs: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let x = self.stem.forward(inputs)?;
        let x = self.head.forward(x)?;
        let x = self.pool.forward(x).flatten::<2>(1, 3);

        Ok(self.classifier.forward(x))
    }

    fn set_mode(&mut self, mode: NormMode) {
        self.stem.norm.set_mode(mode);
        self.head.norm.set_mode(mode);
    }
}
