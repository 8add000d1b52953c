//! Port definitions for decoding, encoding and editing artifacts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::ImageFormat;

use crate::domain::entities::DecodedImage;

/// Decodes raw bytes into images and encodes images back to bytes.
pub trait Decoder: Send + Sync {
    /// Returns true if `data` is in a format this decoder understands.
    fn can_decode(&self, data: &[u8]) -> bool;

    /// Decodes `data`. Returns None if decoding fails.
    fn decode(&self, data: &[u8]) -> Option<DecodedImage>;

    /// Normalizes a decoded image's pixel buffer for fast display.
    /// Returns None if the image is already in its final form.
    fn decompress(&self, image: &DecodedImage, data: &[u8]) -> Option<DecodedImage>;

    /// Returns true if images can be encoded to `format`.
    fn can_encode(&self, format: ImageFormat) -> bool;

    /// Encodes `image` to `format`. Returns None if encoding fails.
    fn encode(&self, image: &DecodedImage, format: ImageFormat) -> Option<Vec<u8>>;
}

/// Decodes partially downloaded data.
pub trait ProgressiveDecoder: Send + Sync {
    /// Returns true if `data` (possibly truncated) can be decoded incrementally.
    fn can_incrementally_decode(&self, data: &[u8]) -> bool;

    /// Starts a new incremental decode. Each download operation owns its own
    /// session since sessions keep state between calls.
    fn begin(&self) -> Box<dyn IncrementalDecode>;
}

/// Stateful incremental decoding session for one download.
pub trait IncrementalDecode: Send {
    /// Appends `chunk` to the data seen so far and decodes what is there.
    /// `finished` is true once the download has delivered its last byte.
    fn push(&mut self, chunk: &[u8], finished: bool) -> Option<DecodedImage>;
}

/// Opens multi-frame data for frame-by-frame access.
pub trait AnimatedDecoder: Send + Sync {
    /// Returns true if `data` holds a multi-frame image this decoder handles.
    fn can_decode_animation(&self, data: &[u8]) -> bool;

    /// Opens `data` for random frame access.
    fn open(&self, data: Bytes) -> Option<Box<dyn FrameSource>>;
}

/// Random access to the frames of one multi-frame payload.
pub trait FrameSource: Send + Sync {
    /// Number of frames.
    fn frame_count(&self) -> usize;

    /// Number of times the animation repeats; 0 repeats forever.
    fn loop_count(&self) -> u32;

    /// Decodes frame `index`. `decompress` requests a display-ready buffer.
    fn frame(&self, index: usize, decompress: bool) -> Option<DecodedImage>;

    /// Frame dimensions without decoding, when known.
    fn frame_size(&self, index: usize) -> Option<(u32, u32)>;

    /// Display duration of frame `index`.
    fn duration(&self, index: usize) -> Option<Duration>;

    /// The encoded payload.
    fn data(&self) -> &Bytes;
}

/// Transforms a decoded image. The key identifies the transformation so a
/// cached result can be recognized as already edited.
#[cfg_attr(test, mockall::automock)]
pub trait Editor: Send + Sync {
    /// Stable identifier of this edit.
    fn key(&self) -> String;

    /// Applies the edit. Returns None if the edit fails.
    fn edit(&self, image: &DecodedImage) -> Option<DecodedImage>;
}

/// Applies `editor` and stamps the result with the editor's key.
pub fn apply_edit(editor: &dyn Editor, image: &DecodedImage) -> Option<DecodedImage> {
    let mut edited = editor.edit(image)?;
    edited.edit_key = Some(editor.key());
    if edited.format.is_none() {
        edited.format = image.format;
    }
    Some(edited)
}

/// The codec capabilities available to the pipeline, resolved once when the
/// pipeline is built.
#[derive(Clone)]
pub struct Codecs {
    decoder: Arc<dyn Decoder>,
    progressive: Option<Arc<dyn ProgressiveDecoder>>,
    animated: Option<Arc<dyn AnimatedDecoder>>,
}

impl Codecs {
    /// Creates a codec set with only still-image support.
    #[must_use]
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self {
            decoder,
            progressive: None,
            animated: None,
        }
    }

    /// Adds incremental decoding.
    #[must_use]
    pub fn with_progressive(mut self, progressive: Arc<dyn ProgressiveDecoder>) -> Self {
        self.progressive = Some(progressive);
        self
    }

    /// Adds multi-frame decoding.
    #[must_use]
    pub fn with_animated(mut self, animated: Arc<dyn AnimatedDecoder>) -> Self {
        self.animated = Some(animated);
        self
    }

    /// Still-image decoder and encoder.
    #[must_use]
    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.decoder
    }

    /// Incremental decoder, if available.
    #[must_use]
    pub fn progressive(&self) -> Option<&Arc<dyn ProgressiveDecoder>> {
        self.progressive.as_ref()
    }

    /// Multi-frame decoder, if available.
    #[must_use]
    pub fn animated(&self) -> Option<&Arc<dyn AnimatedDecoder>> {
        self.animated.as_ref()
    }
}

impl std::fmt::Debug for Codecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codecs")
            .field("progressive", &self.progressive.is_some())
            .field("animated", &self.animated.is_some())
            .finish_non_exhaustive()
    }
}
