//! Audio-side building blocks: format math, the codec seam, the transmit
//! sink, and pooled buffers.

pub mod buffer;
pub mod codec;
pub mod filter;
pub mod format;
#[cfg(feature = "opus")]
pub mod opus;
pub mod sink;

pub use codec::{CodecFactory, FrameDecoder, FrameEncoder, PacketCodec};
pub use filter::PcmFilter;
pub use format::{AudioFormat, QualityPreset};
pub use sink::{FilterId, RawVoicePacket, TransmitSink};
