use burn::prelude::*;

/// Exponential linear unit: `x` for positive inputs, `exp(x) - 1` otherwise.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().lower_equal_elem(0.0);
    let saturated = x.clone().exp().sub_scalar(1.0);

    x.mask_where(negative, saturated)
}
