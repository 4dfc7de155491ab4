mod activation;
mod blocks;
mod init;
mod norm;
mod unet;

pub use activation::elu;
pub use blocks::{
    ConvBlock, ConvBlockConfig, ConvNormConfig, ConvNormUnit, DecoderBlock, DecoderBlockConfig,
    EncoderBlock, EncoderBlockConfig,
};
pub use init::truncated_normal;
pub use norm::{BatchNorm, BatchNormConfig};
pub use unet::{UNet, UNetConfig, UNetOutput};
