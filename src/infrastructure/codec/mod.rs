//! Default decode, encode and animation collaborators.

pub mod image_codec;

#[cfg(test)]
pub use image_codec::fixtures;
pub use image_codec::ImageCodec;
