pub mod error;
pub mod loss;
pub mod model;

#[cfg(feature = "training")]
pub mod training;

pub use error::UNetError;
pub use loss::{SigmoidCrossEntropyLoss, SigmoidCrossEntropyLossConfig};
pub use model::{UNet, UNetConfig, UNetOutput};

#[cfg(feature = "training")]
pub use training::{IoUMetric, SegmentationBatch, SegmentationOutput};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
