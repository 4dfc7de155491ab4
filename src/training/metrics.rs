use std::marker::PhantomData;

use burn::prelude::*;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{Metric, MetricEntry, MetricMetadata, Numeric};
use derive_new::new;

/// Intersection over union of the foreground class, in percent.
pub struct IoUMetric<B: Backend> {
    state: NumericMetricState,
    threshold: f64,
    _b: PhantomData<B>,
}

#[derive(new)]
pub struct IoUInput<B: Backend> {
    probabilities: Tensor<B, 4>,
    targets: Tensor<B, 4>,
}

impl<B: Backend> Default for IoUMetric<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> IoUMetric<B> {
    pub fn new() -> Self {
        Self {
            state: NumericMetricState::default(),
            threshold: 0.5,
            _b: PhantomData,
        }
    }

    /// Probability from which a pixel counts as foreground.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// IoU of the thresholded probabilities against binary targets.
///
/// A batch with no foreground in either prediction or target is a perfect match.
pub(crate) fn binary_iou<B: Backend>(
    probabilities: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    threshold: f64,
) -> f64 {
    let predictions = probabilities.greater_equal_elem(threshold).float();
    let targets = targets.greater_elem(0.5).float();

    let intersection = (predictions.clone() * targets.clone())
        .sum()
        .into_scalar()
        .elem::<f64>();
    let union = (predictions.clone() + targets.clone() - predictions * targets)
        .sum()
        .into_scalar()
        .elem::<f64>();

    if union > 0.0 {
        intersection / union
    } else {
        1.0
    }
}

impl<B: Backend> Metric for IoUMetric<B> {
    type Input = IoUInput<B>;
    const NAME: &'static str = "IoU";

    fn update(&mut self, input: &IoUInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [batch_size, _, _, _] = input.probabilities.dims();

        let iou = binary_iou(
            input.probabilities.clone(),
            input.targets.clone(),
            self.threshold,
        );

        self.state.update(
            100.0 * iou,
            batch_size,
            FormatOptions::new(Self::NAME).unit("%").precision(2),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for IoUMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
