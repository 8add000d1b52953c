mod codec_port;
mod memory_probe_port;
mod transport_port;

pub use codec_port::{
    AnimatedDecoder, Codecs, Decoder, Editor, FrameSource, IncrementalDecode, ProgressiveDecoder,
    apply_edit,
};
pub use memory_probe_port::MemoryProbe;
pub use transport_port::{DownloadRequest, ResponseBody, Transport};

#[cfg(test)]
pub use codec_port::MockEditor;

#[cfg(test)]
pub mod mocks {
    pub use super::codec_port::mock::{FlipEditor, ScriptedFrames};
    pub use super::memory_probe_port::mock::FixedMemory;
    pub use super::transport_port::mock::{Reply, ScriptedTransport};
}
