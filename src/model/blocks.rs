use burn::{
    module::Param,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::Distribution,
};

use super::{
    activation::elu,
    init::truncated_normal,
    norm::{BatchNorm, BatchNormConfig},
};
use crate::error::UNetError;

/// Normalization and initialization settings shared by every hidden convolution.
#[derive(Config, Debug)]
pub struct ConvNormConfig {
    #[config(default = 0.9)]
    pub batch_norm_decay: f64,
    #[config(default = 1e-3)]
    pub batch_norm_epsilon: f64,
    #[config(default = 0.1)]
    pub weight_init_stddev: f64,
}

impl ConvNormConfig {
    fn batch_norm<B: Backend>(&self, num_features: usize, device: &B::Device) -> BatchNorm<B> {
        BatchNormConfig::new(num_features)
            .with_decay(self.batch_norm_decay)
            .with_epsilon(self.batch_norm_epsilon)
            .init(device)
    }
}

/// 3x3 convolution followed by batch normalization and ELU.
#[derive(Module, Debug)]
pub struct ConvNormUnit<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNormUnit<B> {
    pub fn forward(&self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x, training);

        elu(x)
    }
}

fn conv_norm_unit<B: Backend>(
    input_channels: usize,
    num_filters: usize,
    norm: &ConvNormConfig,
    device: &B::Device,
) -> ConvNormUnit<B> {
    // The normalization offset takes the role of the bias.
    let mut conv = Conv2dConfig::new([input_channels, num_filters], [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .with_bias(false)
        .init(device);
    conv.weight = Param::from_tensor(truncated_normal(
        [num_filters, input_channels, 3, 3],
        norm.weight_init_stddev,
        device,
    ));

    ConvNormUnit {
        conv,
        norm: norm.batch_norm(num_filters, device),
    }
}

/// Two stacked conv units with dropout in between.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    unit1: ConvNormUnit<B>,
    unit2: ConvNormUnit<B>,
    keep_prob: f64,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let x = self.unit1.forward(x, training);
        let x = self.dropout(x, training);

        self.unit2.forward(x, training)
    }

    /// Inverted dropout, applied in training mode on every backend.
    fn dropout(&self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        if !training || self.keep_prob >= 1.0 {
            return x;
        }

        let keep = x.random_like(Distribution::Bernoulli(self.keep_prob));
        x.mul(keep).div_scalar(self.keep_prob)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    input_channels: usize,
    num_filters: usize,
    norm: ConvNormConfig,
    #[config(default = "0.8")]
    keep_prob: f64,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            unit1: conv_norm_unit(self.input_channels, self.num_filters, &self.norm, device),
            unit2: conv_norm_unit(self.num_filters, self.num_filters, &self.norm, device),
            keep_prob: self.keep_prob,
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    conv_block: ConvBlock<B>,
    max_pool: MaxPool2d,
}

impl<B: Backend> EncoderBlock<B> {
    /// Returns the downsampled tensor and the skip features kept for the decoder.
    pub fn forward(&self, x: Tensor<B, 4>, training: bool) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip_features = self.conv_block.forward(x, training);
        let x = self.max_pool.forward(skip_features.clone());

        (x, skip_features)
    }
}

#[derive(Config, Debug)]
pub struct EncoderBlockConfig {
    conv_block: ConvBlockConfig,
    #[config(default = "2")]
    pool_kernel_size: usize,
}

impl EncoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        let kernel = self.pool_kernel_size;
        let padding = (kernel - 1) / 2;

        EncoderBlock {
            conv_block: self.conv_block.init(device),
            max_pool: MaxPool2dConfig::new([kernel, kernel])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    conv_transpose: ConvTranspose2d<B>,
    norm: BatchNorm<B>,
    conv_block: ConvBlock<B>,
}

impl<B: Backend> DecoderBlock<B> {
    /// Upsamples `x`, joins it with the matching encoder features and refines the result.
    ///
    /// `stage` only identifies the block in errors.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        skip_features: Tensor<B, 4>,
        stage: usize,
        training: bool,
    ) -> Result<Tensor<B, 4>, UNetError> {
        let x = self.upsample(x, training);

        let [_, up_channels, up_height, up_width] = x.dims();
        let [_, skip_channels, skip_height, skip_width] = skip_features.dims();

        if up_channels != skip_channels {
            return Err(UNetError::ChannelMismatch {
                stage,
                upsampled: up_channels,
                skip: skip_channels,
            });
        }
        if [up_height, up_width] != [skip_height, skip_width] {
            return Err(UNetError::SpatialMismatch {
                stage,
                upsampled: [up_height, up_width],
                skip: [skip_height, skip_width],
            });
        }

        let x = Tensor::cat(vec![skip_features, x], 1);

        Ok(self.conv_block.forward(x, training))
    }

    fn upsample(&self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let x = self.conv_transpose.forward(x);
        let x = self.norm.forward(x, training);

        elu(x)
    }
}

#[derive(Config, Debug)]
pub struct DecoderBlockConfig {
    input_channels: usize,
    num_filters: usize,
    conv_block: ConvBlockConfig,
}

impl DecoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        let norm = &self.conv_block.norm;

        let mut conv_transpose =
            ConvTranspose2dConfig::new([self.input_channels, self.num_filters], [2, 2])
                .with_stride([2, 2])
                .with_bias(false)
                .init(device);
        conv_transpose.weight = Param::from_tensor(truncated_normal(
            [self.input_channels, self.num_filters, 2, 2],
            norm.weight_init_stddev,
            device,
        ));

        DecoderBlock {
            conv_transpose,
            norm: norm.batch_norm(self.num_filters, device),
            conv_block: self.conv_block.init(device),
        }
    }
}
