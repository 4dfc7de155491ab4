use thiserror::Error;

/// Structural errors raised while running the network graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UNetError {
    #[error(
        "decoder stage {stage}: upsampled tensor has {upsampled} channels but skip features have {skip}"
    )]
    ChannelMismatch {
        stage: usize,
        upsampled: usize,
        skip: usize,
    },

    #[error(
        "decoder stage {stage}: upsampled resolution {upsampled:?} differs from skip resolution {skip:?} (input size must be divisible by 2^depth)"
    )]
    SpatialMismatch {
        stage: usize,
        upsampled: [usize; 2],
        skip: [usize; 2],
    },

    #[error("decoder stage {stage}: no skip features left on the feature stack")]
    MissingSkipFeature { stage: usize },

    #[error("{remaining} skip features left on the feature stack after decoding")]
    UnconsumedSkipFeatures { remaining: usize },

    #[error("per-pixel loss weighting is enabled but no weight batch was supplied")]
    MissingPixelWeights,
}
