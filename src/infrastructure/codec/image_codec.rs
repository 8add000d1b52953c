//! Codec built on the `image` crate.

use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat};
use tracing::{debug, trace};

use crate::domain::entities::DecodedImage;
use crate::domain::ports::{
    AnimatedDecoder, Decoder, FrameSource, IncrementalDecode, ProgressiveDecoder,
};

/// Decodes and encodes PNG, JPEG, WebP and GIF, and opens animated GIFs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_of(data: &[u8]) -> Option<ImageFormat> {
        image::guess_format(data).ok()
    }
}

impl Decoder for ImageCodec {
    fn can_decode(&self, data: &[u8]) -> bool {
        Self::format_of(data).is_some_and(|format| format.reading_enabled())
    }

    fn decode(&self, data: &[u8]) -> Option<DecodedImage> {
        let format = Self::format_of(data)?;
        match image::load_from_memory_with_format(data, format) {
            Ok(image) => Some(DecodedImage::new(image, Some(format))),
            Err(e) => {
                debug!(?format, error = %e, "decode failed");
                None
            }
        }
    }

    fn decompress(&self, image: &DecodedImage, _data: &[u8]) -> Option<DecodedImage> {
        if matches!(image.image, DynamicImage::ImageRgba8(_)) {
            return None;
        }
        let mut normalized = DecodedImage::new(
            DynamicImage::ImageRgba8(image.image.to_rgba8()),
            image.format,
        );
        normalized.edit_key.clone_from(&image.edit_key);
        Some(normalized)
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        matches!(
            format,
            ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif | ImageFormat::WebP
        )
    }

    fn encode(&self, image: &DecodedImage, format: ImageFormat) -> Option<Vec<u8>> {
        let source = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.image.to_rgb8()),
            ImageFormat::WebP | ImageFormat::Gif => DynamicImage::ImageRgba8(image.image.to_rgba8()),
            _ => image.image.clone(),
        };
        let mut out = Cursor::new(Vec::new());
        match source.write_to(&mut out, format) {
            Ok(()) => Some(out.into_inner()),
            Err(e) => {
                debug!(?format, error = %e, "encode failed");
                None
            }
        }
    }
}

impl ProgressiveDecoder for ImageCodec {
    fn can_incrementally_decode(&self, data: &[u8]) -> bool {
        matches!(
            Self::format_of(data),
            Some(ImageFormat::Png | ImageFormat::Jpeg)
        )
    }

    fn begin(&self) -> Box<dyn IncrementalDecode> {
        Box::new(IncrementalSession::default())
    }
}

/// Buffers the received data and retries a full decode whenever more
/// arrived. Truncated data usually fails; the session then keeps the last
/// good image.
#[derive(Default)]
struct IncrementalSession {
    data: Vec<u8>,
    last: Option<DecodedImage>,
}

impl IncrementalDecode for IncrementalSession {
    fn push(&mut self, chunk: &[u8], finished: bool) -> Option<DecodedImage> {
        if chunk.is_empty() && !finished {
            return self.last.clone();
        }
        self.data.extend_from_slice(chunk);
        let format = ImageCodec::format_of(&self.data)?;
        if let Ok(image) = image::load_from_memory_with_format(&self.data, format) {
            trace!(bytes = self.data.len(), finished, "incremental decode produced an image");
            self.last = Some(DecodedImage::new(image, Some(format)));
        }
        self.last.clone()
    }
}

impl AnimatedDecoder for ImageCodec {
    fn can_decode_animation(&self, data: &[u8]) -> bool {
        Self::format_of(data) == Some(ImageFormat::Gif)
    }

    fn open(&self, data: Bytes) -> Option<Box<dyn FrameSource>> {
        let source = GifFrames::open(data)?;
        (source.frame_count() > 1).then(|| Box::new(source) as Box<dyn FrameSource>)
    }
}

/// Frames of an animated GIF. Frame metadata is read once at open time;
/// pixels are decoded on request.
struct GifFrames {
    data: Bytes,
    frames: Vec<FrameInfo>,
}

struct FrameInfo {
    duration: Duration,
    size: (u32, u32),
}

impl GifFrames {
    fn open(data: Bytes) -> Option<Self> {
        let decoder = GifDecoder::new(Cursor::new(data.clone())).ok()?;
        let mut frames = Vec::new();
        for frame in decoder.into_frames() {
            let frame = frame.ok()?;
            frames.push(FrameInfo {
                duration: Duration::from(frame.delay()),
                size: frame.buffer().dimensions(),
            });
        }
        Some(Self { data, frames })
    }
}

impl FrameSource for GifFrames {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn loop_count(&self) -> u32 {
        0
    }

    fn frame(&self, index: usize, _decompress: bool) -> Option<DecodedImage> {
        if index >= self.frames.len() {
            return None;
        }
        let decoder = GifDecoder::new(Cursor::new(self.data.clone())).ok()?;
        let frame = decoder.into_frames().nth(index)?.ok()?;
        Some(DecodedImage::new(
            DynamicImage::ImageRgba8(frame.into_buffer()),
            Some(ImageFormat::Gif),
        ))
    }

    fn frame_size(&self, index: usize) -> Option<(u32, u32)> {
        self.frames.get(index).map(|info| info.size)
    }

    fn duration(&self, index: usize) -> Option<Duration> {
        self.frames.get(index).map(|info| info.duration)
    }

    fn data(&self) -> &Bytes {
        &self.data
    }
}

#[cfg(test)]
pub mod fixtures {
    //! Small encoded images for tests.

    use super::*;
    use image::codecs::gif::{GifEncoder, Repeat};
    use image::{Delay, Frame, Rgba, RgbaImage};

    /// A `side`x`side` PNG.
    pub fn png(side: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(side, side, Rgba([9, 8, 7, 255])));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// An animated GIF with `count` 4x4 frames of 50 ms each.
    pub fn gif(count: u8) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder.set_repeat(Repeat::Infinite).unwrap();
            for i in 0..count {
                let pixels = RgbaImage::from_pixel(4, 4, Rgba([i.wrapping_mul(40), 0, 0, 255]));
                encoder
                    .encode_frame(Frame::from_parts(
                        pixels,
                        0,
                        0,
                        Delay::from_numer_denom_ms(50, 1),
                    ))
                    .unwrap();
            }
        }
        out
    }
}
