use burn::{
    module::{Param, RunningState},
    prelude::*,
};

/// Configuration to create a [BatchNorm] layer for channels-first image tensors.
#[derive(Config, Debug)]
pub struct BatchNormConfig {
    /// Number of channels normalized independently.
    pub num_features: usize,
    /// Weight of the previous running statistics when a new batch is folded in.
    #[config(default = 0.9)]
    pub decay: f64,
    /// Added to the variance before taking the square root.
    #[config(default = 1e-3)]
    pub epsilon: f64,
}

impl BatchNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNorm<B> {
        self.assertions();
        BatchNorm {
            gamma: Param::from_tensor(Tensor::ones([self.num_features], device)),
            beta: Param::from_tensor(Tensor::zeros([self.num_features], device)),
            running_mean: RunningState::new(Tensor::zeros([self.num_features], device)),
            running_var: RunningState::new(Tensor::ones([self.num_features], device)),
            decay: self.decay,
            epsilon: self.epsilon,
        }
    }

    fn assertions(&self) {
        assert!(
            (0.0..=1.0).contains(&self.decay),
            "Batch norm decay should be in interval [0, 1]. Got {}",
            self.decay
        );
        assert!(
            self.epsilon > 0.0,
            "Batch norm epsilon must be positive. Got {}",
            self.epsilon
        );
    }
}

/// Batch normalization whose mode is chosen by the caller.
///
/// In training mode the statistics of the current batch normalize the input and are
/// folded into the running averages; otherwise the running averages are used as is.
#[derive(Module, Debug)]
pub struct BatchNorm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    pub running_mean: RunningState<Tensor<B, 1>>,
    pub running_var: RunningState<Tensor<B, 1>>,
    pub decay: f64,
    pub epsilon: f64,
}

impl<B: Backend> BatchNorm<B> {
    /// Normalizes a `[batch, channels, height, width]` tensor.
    pub fn forward(&self, input: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let [batch_size, channels, height, width] = input.dims();

        let (mean, var) = if training {
            let flat = input
                .clone()
                .swap_dims(0, 1)
                .reshape([channels, batch_size * height * width]);
            let mean = flat.clone().mean_dim(1);
            let var = flat.sub(mean.clone()).powf_scalar(2.0).mean_dim(1);
            let mean = mean.reshape([channels]);
            let var = var.reshape([channels]);

            self.update_running_stats(mean.clone(), var.clone(), batch_size * height * width);
            (mean, var)
        } else {
            (self.running_mean.value(), self.running_var.value())
        };

        let shape = [1, channels, 1, 1];
        let std = var.add_scalar(self.epsilon).sqrt().reshape(shape);

        input
            .sub(mean.reshape(shape))
            .div(std)
            .mul(self.gamma.val().reshape(shape))
            .add(self.beta.val().reshape(shape))
    }

    /// Folds the batch statistics of `count` values per channel into the running averages.
    ///
    /// The running variance tracks the unbiased estimate.
    fn update_running_stats(&self, mean: Tensor<B, 1>, var: Tensor<B, 1>, count: usize) {
        let correction = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };

        let running_mean = self
            .running_mean
            .value_sync()
            .mul_scalar(self.decay)
            .add(mean.detach().mul_scalar(1.0 - self.decay));
        let running_var = self
            .running_var
            .value_sync()
            .mul_scalar(self.decay)
            .add(var.detach().mul_scalar(correction * (1.0 - self.decay)));

        self.running_mean.update(running_mean.detach());
        self.running_var.update(running_var.detach());
    }
}
