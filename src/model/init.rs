use burn::{prelude::*, tensor::Distribution};

/// Rounds of resampling before the remaining outliers are clamped to the bound.
const RESAMPLE_ROUNDS: usize = 6;

/// Samples a zero-mean normal tensor whose values lie within two standard deviations.
///
/// Values falling outside `[-2σ, 2σ]` are redrawn; after [RESAMPLE_ROUNDS] rounds the
/// probability of an outlier is negligible and whatever is left is clamped.
pub fn truncated_normal<B: Backend, const D: usize>(
    shape: [usize; D],
    std: f64,
    device: &B::Device,
) -> Tensor<B, D> {
    let bound = 2.0 * std;
    let mut tensor = Tensor::<B, D>::random(shape, Distribution::Normal(0.0, std), device);

    for _ in 0..RESAMPLE_ROUNDS {
        let outliers = tensor.clone().abs().greater_elem(bound);
        let redraw = tensor.random_like(Distribution::Normal(0.0, std));
        tensor = tensor.mask_where(outliers, redraw);
    }

    tensor.clamp(-bound, bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn truncated_normal_stays_within_two_stddev() {
        let device = Default::default();
        let std = 0.1;

        let weights = truncated_normal::<TestBackend, 4>([32, 16, 3, 3], std, &device);

        assert_eq!(weights.dims(), [32, 16, 3, 3]);
        let max = weights.clone().abs().max().into_scalar();
        assert!(max <= (2.0 * std) as f32 + 1e-6, "max magnitude {max}");
        let mean = weights.mean().into_scalar();
        assert!(mean.abs() < 0.02, "mean {mean}");
    }
}
