mod sigmoid_cross_entropy;

pub use sigmoid_cross_entropy::{SigmoidCrossEntropyLoss, SigmoidCrossEntropyLossConfig};
