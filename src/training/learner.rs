use burn::{
    backend::NdArray,
    prelude::*,
    tensor::{Transaction, backend::AutodiffBackend},
    train::{
        TrainOutput, TrainStep, ValidStep,
        metric::{Adaptor, ItemLazy, LossInput},
    },
};
use derive_new::new;

use super::metrics::IoUInput;
use crate::model::{UNet, UNetOutput};

/// A channels-last batch as handed over by an external data pipeline.
#[derive(new, Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch_size, height, width, channels]`
    pub images: Tensor<B, 4>,
    /// `[batch_size, height, width, 1]`, values in {0, 1}
    pub masks: Tensor<B, 4>,
    /// Per-pixel loss weights, required when the network weights its loss.
    pub weights: Option<Tensor<B, 4>>,
}

#[derive(new)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Probabilities, `[batch_size, height, width, 1]`.
    pub output: Tensor<B, 4>,
    pub targets: Tensor<B, 4>,
}

impl<B: Backend> SegmentationOutput<B> {
    fn from_build(output: UNetOutput<B>, targets: Tensor<B, 4>) -> Self {
        Self::new(output.loss, output.probabilities, targets)
    }
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = SegmentationOutput<NdArray>;

    fn sync(self) -> Self::ItemSync {
        let [output, loss, targets] = Transaction::default()
            .register(self.output)
            .register(self.loss)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let device = &Default::default();

        SegmentationOutput {
            output: Tensor::from_data(output, device),
            loss: Tensor::from_data(loss, device),
            targets: Tensor::from_data(targets, device),
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<IoUInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> IoUInput<B> {
        IoUInput::new(self.output.clone(), self.targets.clone())
    }
}

impl<B: Backend> UNet<B> {
    /// Runs one batch in the given mode.
    ///
    /// # Panics
    ///
    /// On a structural error, since a learner step has no way to recover from a
    /// network that does not fit its configuration.
    pub fn forward_segmentation(
        &self,
        batch: SegmentationBatch<B>,
        training: bool,
    ) -> SegmentationOutput<B> {
        let targets = batch.masks.clone();
        let output = self
            .build_with_mode(batch.images, batch.masks, batch.weights, training)
            .unwrap_or_else(|err| panic!("U-Net graph construction failed: {err}"));

        SegmentationOutput::from_build(output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch, true);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UNetConfig;
    use burn::{backend::Autodiff, tensor::Distribution};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn batch<B: Backend>(device: &B::Device) -> SegmentationBatch<B> {
        SegmentationBatch::new(
            Tensor::random([2, 8, 8, 1], Distribution::Normal(0.0, 1.0), device),
            Tensor::random([2, 8, 8, 1], Distribution::Bernoulli(0.5), device),
            None,
        )
    }

    fn config() -> UNetConfig {
        UNetConfig::new()
            .with_depth(2)
            .with_base_feature_size(4)
            .with_head_feature_size(4)
    }

    #[test]
    fn train_step_produces_loss_and_gradients() {
        let device = Default::default();
        let model = config().init::<TestAutodiffBackend>(&device);

        let output = <UNet<TestAutodiffBackend> as TrainStep<_, _>>::step(&model, batch(&device));

        assert_eq!(output.item.loss.dims(), [1]);
        assert_eq!(output.item.output.dims(), [2, 8, 8, 1]);
        assert_eq!(output.item.targets.dims(), [2, 8, 8, 1]);
    }

    #[test]
    fn valid_step_runs_in_inference_mode() {
        let device = Default::default();
        // Training is the configured default; validation must still be deterministic.
        let model = config().init::<TestBackend>(&device);
        let batch = batch::<TestBackend>(&device);

        let first = <UNet<TestBackend> as ValidStep<_, _>>::step(&model, batch.clone());
        let second = <UNet<TestBackend> as ValidStep<_, _>>::step(&model, batch);

        first
            .output
            .into_data()
            .assert_approx_eq(&second.output.into_data(), 6);
    }

    #[test]
    #[should_panic(expected = "per-pixel loss weighting is enabled")]
    fn missing_weights_abort_the_step() {
        let device = Default::default();
        let model = config()
            .with_use_per_pixel_weights(true)
            .init::<TestBackend>(&device);

        let _ = model.forward_segmentation(batch(&device), false);
    }

    #[test]
    fn sync_moves_output_to_cpu() {
        let device = Default::default();
        let model = config().init::<TestBackend>(&device);
        let output = model.forward_segmentation(batch(&device), false);
        let loss = output.loss.clone().into_data();

        let synced = output.sync();

        synced.loss.into_data().assert_approx_eq(&loss, 6);
        assert_eq!(synced.output.dims(), [2, 8, 8, 1]);
    }
}
