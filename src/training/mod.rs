pub mod learner;
pub mod metrics;

pub use learner::{SegmentationBatch, SegmentationOutput};
pub use metrics::{IoUInput, IoUMetric};
