//! Sigmoid Cross Entropy Loss
//!
//! Binary cross-entropy computed directly from logits for single-channel
//! segmentation maps, with optional per-pixel weighting and label smoothing.
//!
//! The elementwise term uses the numerically stable formulation
//! `max(x, 0) - x * z + log(1 + exp(-|x|))` so large logits never overflow.

use std::marker::PhantomData;

use burn::{
    module::{Content, DisplaySettings, ModuleDisplay},
    prelude::*,
};

/// Configuration to create a [SigmoidCrossEntropyLoss] instance.
///
/// # Example
///
/// ```rust,ignore
/// let loss_fn = SigmoidCrossEntropyLossConfig::new()
///     .with_smoothing(Some(0.1))
///     .init(&device);
///
/// let loss = loss_fn.forward(logits, masks, Some(weights));
/// ```
#[derive(Config, Debug)]
pub struct SigmoidCrossEntropyLossConfig {
    /// Optional label smoothing factor (between 0.0 and 1.0).
    ///
    /// Hard labels {0, 1} will be changed to z_smoothed = z(1 - α) + α / 2.
    ///
    /// Default: None (no smoothing)
    pub smoothing: Option<f32>,

    /// How the weighted sum of elementwise losses is normalized.
    ///
    /// - If false, it is divided by the number of pixels with a non-zero weight.
    ///   Without weights this is the plain mean over all pixels.
    /// - If true, it is divided by the sum of the weights.
    ///
    /// In both cases the loss is 0 when the divisor is 0.
    ///
    /// Default: false
    #[config(default = false)]
    pub normalize_by_weight_sum: bool,
}

impl SigmoidCrossEntropyLossConfig {
    /// Initialize a new [SigmoidCrossEntropyLoss] instance from this configuration.
    pub fn init<B: Backend>(&self, _device: &B::Device) -> SigmoidCrossEntropyLoss<B> {
        self.assertions();
        SigmoidCrossEntropyLoss {
            smoothing: self.smoothing,
            normalize_by_weight_sum: self.normalize_by_weight_sum,
            _b: PhantomData,
        }
    }

    fn assertions(&self) {
        if let Some(alpha) = self.smoothing {
            assert!(
                (0.0..=1.).contains(&alpha),
                "Alpha of sigmoid cross-entropy with smoothed labels should be in interval [0, 1]. Got {}",
                alpha
            );
        };
    }
}

/// Sigmoid cross-entropy between single-channel logits and binary masks.
///
/// # Input Tensor Shapes
///
/// Any layout works as long as the three tensors agree; the network feeds
/// `[batch_size, height, width, 1]` tensors.
///
/// - logits: raw network output, no activation applied
/// - targets: ground truth in {0, 1}
/// - weights: optional per-pixel weights
///
/// Should be created using [SigmoidCrossEntropyLossConfig].
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct SigmoidCrossEntropyLoss<B: Backend> {
    /// Label smoothing factor.
    pub smoothing: Option<f32>,
    /// Divide by the weight sum instead of the non-zero weight count.
    pub normalize_by_weight_sum: bool,
    _b: PhantomData<B>,
}

impl<B: Backend> ModuleDisplay for SigmoidCrossEntropyLoss<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("smoothing", &self.smoothing)
            .add("normalize_by_weight_sum", &self.normalize_by_weight_sum)
            .optional()
    }
}

impl<B: Backend> SigmoidCrossEntropyLoss<B> {
    /// Compute the reduced loss.
    ///
    /// # Returns
    ///
    /// A tensor of shape `[1]`.
    pub fn forward<const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
        weights: Option<Tensor<B, D>>,
    ) -> Tensor<B, 1> {
        Self::assertions(&logits, &targets, weights.as_ref());

        let elementwise = self.forward_elementwise(logits, targets);

        let Some(weights) = weights else {
            return elementwise.mean();
        };

        let total = (elementwise * weights.clone()).sum();
        let divisor = if self.normalize_by_weight_sum {
            weights.sum()
        } else {
            weights.not_equal_elem(0.0).float().sum()
        };
        tracing::debug!("Weighted loss divisor: {:?}", divisor);

        let empty = divisor.clone().equal_elem(0.0);
        let divisor = divisor.mask_fill(empty.clone(), 1.0);

        (total / divisor).mask_fill(empty, 0.0)
    }

    /// Compute the unreduced loss, one value per element of `logits`.
    pub fn forward_elementwise<const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let targets = match self.smoothing {
            Some(alpha) => targets
                .mul_scalar(1.0 - alpha)
                .add_scalar(alpha / 2.0),
            None => targets,
        };

        let positive_part = logits.clone().clamp_min(0.0);
        let log_term = logits.clone().abs().neg().exp().log1p();

        positive_part - logits * targets + log_term
    }

    fn assertions<const D: usize>(
        logits: &Tensor<B, D>,
        targets: &Tensor<B, D>,
        weights: Option<&Tensor<B, D>>,
    ) {
        let logits_dims = logits.dims();
        let targets_dims = targets.dims();

        assert_eq!(
            logits_dims, targets_dims,
            "Shape mismatch: logits ({:?}) vs targets ({:?})",
            logits_dims, targets_dims
        );

        if let Some(weights) = weights {
            let weights_dims = weights.dims();
            assert_eq!(
                logits_dims, weights_dims,
                "Shape mismatch: logits ({:?}) vs weights ({:?})",
                logits_dims, weights_dims
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn reference(x: f32, z: f32) -> f32 {
        let p = 1.0 / (1.0 + (-x).exp());
        -(z * p.ln() + (1.0 - z) * (1.0 - p).ln())
    }

    fn tensor(values: [f32; 4]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape([2, 2])
    }

    #[test]
    fn unweighted_loss_is_mean_binary_cross_entropy() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);
        let logits = [2.0, -1.0, 0.5, -3.0];
        let targets = [1.0, 0.0, 0.0, 1.0];

        let value = loss.forward(tensor(logits), tensor(targets), None);

        let expected: f32 = logits
            .iter()
            .zip(targets.iter())
            .map(|(&x, &z)| reference(x, z))
            .sum::<f32>()
            / 4.0;
        value
            .into_data()
            .assert_approx_eq(&TensorData::from([expected]), 4);
    }

    #[test]
    fn weighted_loss_divides_by_non_zero_weight_count() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);
        let logits = [2.0, -1.0, 0.5, -3.0];
        let targets = [1.0, 0.0, 0.0, 1.0];
        let weights = [2.0, 0.0, 1.0, 0.0];

        let value = loss.forward(tensor(logits), tensor(targets), Some(tensor(weights)));

        let expected = (2.0 * reference(2.0, 1.0) + reference(0.5, 0.0)) / 2.0;
        value
            .into_data()
            .assert_approx_eq(&TensorData::from([expected]), 4);
    }

    #[test]
    fn weighted_loss_can_divide_by_weight_sum() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new()
            .with_normalize_by_weight_sum(true)
            .init::<TestBackend>(&device);
        let weights = [2.0, 0.0, 1.0, 0.0];

        let value = loss.forward(
            tensor([2.0, -1.0, 0.5, -3.0]),
            tensor([1.0, 0.0, 0.0, 1.0]),
            Some(tensor(weights)),
        );

        let expected = (2.0 * reference(2.0, 1.0) + reference(0.5, 0.0)) / 3.0;
        value
            .into_data()
            .assert_approx_eq(&TensorData::from([expected]), 4);
    }

    #[test]
    fn all_zero_weights_give_zero_loss() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);

        let value = loss.forward(
            tensor([2.0, -1.0, 0.5, -3.0]),
            tensor([0.0, 1.0, 1.0, 0.0]),
            Some(tensor([0.0; 4])),
        );

        value
            .into_data()
            .assert_approx_eq(&TensorData::from([0.0f32]), 6);
    }

    #[test]
    fn unit_weights_match_unweighted_loss() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);
        let logits = [0.3, -0.7, 1.5, -2.0];
        let targets = [1.0, 1.0, 0.0, 0.0];

        let weighted = loss.forward(tensor(logits), tensor(targets), Some(tensor([1.0; 4])));
        let unweighted = loss.forward(tensor(logits), tensor(targets), None);

        weighted
            .into_data()
            .assert_approx_eq(&unweighted.into_data(), 5);
    }

    #[test]
    fn large_logits_stay_finite() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);

        let value = loss
            .forward_elementwise(tensor([200.0, -200.0, 200.0, -200.0]), tensor([1.0, 0.0, 0.0, 1.0]));

        value
            .into_data()
            .assert_approx_eq(&TensorData::from([[0.0f32, 0.0], [200.0, 200.0]]), 3);
    }

    #[test]
    fn smoothing_pulls_targets_towards_one_half() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new()
            .with_smoothing(Some(0.2))
            .init::<TestBackend>(&device);

        let value = loss.forward_elementwise(tensor([1.0; 4]), tensor([1.0, 0.0, 1.0, 0.0]));

        let expected = [
            reference(1.0, 0.9),
            reference(1.0, 0.1),
            reference(1.0, 0.9),
            reference(1.0, 0.1),
        ];
        value
            .into_data()
            .assert_approx_eq(&TensorData::from([[expected[0], expected[1]], [expected[2], expected[3]]]), 4);
    }

    #[test]
    #[should_panic(expected = "Shape mismatch")]
    fn mismatched_shapes_panic() {
        let device = Default::default();
        let loss = SigmoidCrossEntropyLossConfig::new().init::<TestBackend>(&device);
        let logits = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        let targets = Tensor::<TestBackend, 2>::zeros([2, 3], &device);

        let _ = loss.forward(logits, targets, None);
    }
}
