use burn::{
    module::Param,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::sigmoid,
};
use derive_new::new;

use super::{
    blocks::{
        ConvBlock, ConvBlockConfig, ConvNormConfig, DecoderBlock, DecoderBlockConfig,
        EncoderBlock, EncoderBlockConfig,
    },
    init::truncated_normal,
};
use crate::{
    error::UNetError,
    loss::{SigmoidCrossEntropyLoss, SigmoidCrossEntropyLossConfig},
};

/// Everything a single build produces.
#[derive(new, Debug, Clone)]
pub struct UNetOutput<B: Backend> {
    /// Raw head output, `[batch_size, height, width, 1]`.
    pub logits: Tensor<B, 4>,
    /// `sigmoid(logits)`, for inspection only.
    pub probabilities: Tensor<B, 4>,
    /// Reduced sigmoid cross-entropy, shape `[1]`.
    pub loss: Tensor<B, 1>,
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    encoder_blocks: Vec<EncoderBlock<B>>,
    bottleneck: ConvBlock<B>,
    decoder_blocks: Vec<DecoderBlock<B>>,
    output_block: ConvBlock<B>,
    final_conv: Conv2d<B>,
    loss: SigmoidCrossEntropyLoss<B>,
    is_training: bool,
    use_per_pixel_weights: bool,
}

/// Hyper-parameters of the network. Images and masks are channels-last.
#[derive(Config, Debug)]
pub struct UNetConfig {
    #[config(default = "1")]
    pub input_channels: usize,
    /// Number of downsampling (and upsampling) stages.
    #[config(default = "4")]
    pub depth: usize,
    /// Width of the first encoder stage; every further stage doubles it.
    #[config(default = "32")]
    pub base_feature_size: usize,
    #[config(default = "32")]
    pub head_feature_size: usize,
    #[config(default = true)]
    pub is_training: bool,
    #[config(default = 0.9)]
    pub batch_norm_decay: f64,
    #[config(default = 1e-3)]
    pub batch_norm_epsilon: f64,
    #[config(default = 0.8)]
    pub dropout_keep_prob: f64,
    #[config(default = 0.1)]
    pub weight_init_stddev: f64,
    #[config(default = 0.01)]
    pub head_init_stddev: f64,
    /// Max-pool kernel, 2 or 3. The stride is always 2.
    #[config(default = "2")]
    pub pool_kernel_size: usize,
    #[config(default = false)]
    pub use_per_pixel_weights: bool,
    pub label_smoothing: Option<f32>,
    #[config(default = false)]
    pub normalize_loss_by_weight_sum: bool,
}

impl UNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        self.assertions();

        let norm = ConvNormConfig::new()
            .with_batch_norm_decay(self.batch_norm_decay)
            .with_batch_norm_epsilon(self.batch_norm_epsilon)
            .with_weight_init_stddev(self.weight_init_stddev);
        let conv_block = |input_channels: usize, num_filters: usize| {
            ConvBlockConfig::new(input_channels, num_filters, norm.clone())
                .with_keep_prob(self.dropout_keep_prob)
        };

        let mut input_channels = self.input_channels;
        let mut encoder_blocks = Vec::with_capacity(self.depth);
        for width in self.encoder_widths() {
            encoder_blocks.push(
                EncoderBlockConfig::new(conv_block(input_channels, width))
                    .with_pool_kernel_size(self.pool_kernel_size)
                    .init(device),
            );
            input_channels = width;
        }

        let bottleneck = conv_block(input_channels, self.bottleneck_width()).init(device);
        input_channels = self.bottleneck_width();

        let mut decoder_blocks = Vec::with_capacity(self.depth);
        for width in self.decoder_widths() {
            // The skip features contribute as many channels as the upsampled tensor.
            decoder_blocks.push(
                DecoderBlockConfig::new(input_channels, width, conv_block(width * 2, width))
                    .init(device),
            );
            input_channels = width;
        }

        let output_block = conv_block(input_channels, self.head_feature_size).init(device);

        let mut final_conv = Conv2dConfig::new([self.head_feature_size, 1], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        final_conv.weight = Param::from_tensor(truncated_normal(
            [1, self.head_feature_size, 3, 3],
            self.head_init_stddev,
            device,
        ));
        final_conv.bias = Some(Param::from_tensor(Tensor::zeros([1], device)));

        let loss = SigmoidCrossEntropyLossConfig::new()
            .with_smoothing(self.label_smoothing)
            .with_normalize_by_weight_sum(self.normalize_loss_by_weight_sum)
            .init(device);

        tracing::info!(
            "U-Net with depth {}, widths {:?} -> {} -> {:?}, head {}",
            self.depth,
            self.encoder_widths(),
            self.bottleneck_width(),
            self.decoder_widths(),
            self.head_feature_size
        );

        UNet {
            encoder_blocks,
            bottleneck,
            decoder_blocks,
            output_block,
            final_conv,
            loss,
            is_training: self.is_training,
            use_per_pixel_weights: self.use_per_pixel_weights,
        }
    }

    /// Channel width of every encoder stage, shallowest first.
    pub fn encoder_widths(&self) -> Vec<usize> {
        (0..self.depth)
            .map(|stage| self.base_feature_size << stage)
            .collect()
    }

    pub fn bottleneck_width(&self) -> usize {
        self.base_feature_size << self.depth
    }

    /// Channel width of every decoder stage, deepest first.
    pub fn decoder_widths(&self) -> Vec<usize> {
        (0..self.depth)
            .map(|stage| self.bottleneck_width() >> (stage + 1))
            .collect()
    }

    fn assertions(&self) {
        assert!(
            self.input_channels > 0,
            "Input channels must be positive. Got {}",
            self.input_channels
        );
        assert!(
            self.base_feature_size > 0,
            "Base feature size must be positive. Got {}",
            self.base_feature_size
        );
        assert!(
            self.head_feature_size > 0,
            "Head feature size must be positive. Got {}",
            self.head_feature_size
        );
        assert!(
            self.base_feature_size
                .checked_mul(
                    u32::try_from(self.depth)
                        .ok()
                        .and_then(|depth| 1usize.checked_shl(depth))
                        .unwrap_or(0),
                )
                .is_some_and(|width| width > 0),
            "Depth {} overflows the channel width for base feature size {}",
            self.depth,
            self.base_feature_size
        );
        assert!(
            self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0,
            "Dropout keep probability should be in interval (0, 1]. Got {}",
            self.dropout_keep_prob
        );
        assert!(
            self.weight_init_stddev > 0.0 && self.head_init_stddev > 0.0,
            "Initialization stddevs must be positive. Got {} and {}",
            self.weight_init_stddev,
            self.head_init_stddev
        );
        assert!(
            matches!(self.pool_kernel_size, 2 | 3),
            "Pooling kernel size must be 2 or 3. Got {}",
            self.pool_kernel_size
        );
    }
}

impl<B: Backend> UNet<B> {
    /// Runs the network on a channels-last image batch and returns channels-last logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>, UNetError> {
        self.forward_with_mode(images, self.is_training)
    }

    /// Builds logits, probabilities and the loss against `masks` for one batch.
    ///
    /// `weights` is only read when per-pixel weighting is enabled, and is then required.
    pub fn build(
        &self,
        images: Tensor<B, 4>,
        masks: Tensor<B, 4>,
        weights: Option<Tensor<B, 4>>,
    ) -> Result<UNetOutput<B>, UNetError> {
        self.build_with_mode(images, masks, weights, self.is_training)
    }

    pub fn is_training(&self) -> bool {
        self.is_training
    }

    pub fn depth(&self) -> usize {
        self.encoder_blocks.len()
    }

    pub(crate) fn build_with_mode(
        &self,
        images: Tensor<B, 4>,
        masks: Tensor<B, 4>,
        weights: Option<Tensor<B, 4>>,
        training: bool,
    ) -> Result<UNetOutput<B>, UNetError> {
        let weights = if self.use_per_pixel_weights {
            Some(weights.ok_or(UNetError::MissingPixelWeights)?)
        } else {
            None
        };

        let logits = self.forward_with_mode(images, training)?;
        let probabilities = sigmoid(logits.clone());
        let loss = self.loss.forward(logits.clone(), masks, weights);

        Ok(UNetOutput::new(logits, probabilities, loss))
    }

    fn forward_with_mode(
        &self,
        images: Tensor<B, 4>,
        training: bool,
    ) -> Result<Tensor<B, 4>, UNetError> {
        let mut x = images.permute([0, 3, 1, 2]);
        let mut features = Vec::with_capacity(self.encoder_blocks.len());

        for (stage, encoder) in self.encoder_blocks.iter().enumerate() {
            let (pooled, skip_features) = encoder.forward(x, training);
            tracing::debug!("Encoder stage {}: skip {:?}", stage, skip_features.dims());
            features.push(skip_features);
            x = pooled;
        }

        x = self.bottleneck.forward(x, training);
        tracing::debug!(
            "Bottleneck: {:?} with {} skip features stacked",
            x.dims(),
            features.len()
        );

        for (stage, decoder) in self.decoder_blocks.iter().enumerate() {
            let skip_features = features
                .pop()
                .ok_or(UNetError::MissingSkipFeature { stage })?;
            x = decoder.forward(x, skip_features, stage, training)?;
            tracing::debug!("Decoder stage {}: {:?}", stage, x.dims());
        }

        if !features.is_empty() {
            return Err(UNetError::UnconsumedSkipFeatures {
                remaining: features.len(),
            });
        }

        let x = self.output_block.forward(x, training);
        let logits = self.final_conv.forward(x);

        Ok(logits.permute([0, 2, 3, 1]))
    }
}
