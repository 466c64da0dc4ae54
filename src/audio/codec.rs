//! The opaque codec seam and the packet-level wrapper around it.
//!
//! The transport never looks inside compressed frames: encoding, decoding
//! and loss concealment are delegated through these traits. One decoder
//! instance exists per remote source; decoder state is predictive and
//! must never be shared across sources.

use byteorder::{ByteOrder, LittleEndian};

use crate::audio::format::AudioFormat;
use crate::constants::MAX_PACKET_DURATION_MS;
use crate::error::{Result, VoiceError};

/// PCM → compressed frame.
pub trait FrameEncoder: Send {
    /// Encodes one interleaved i16 frame into `out`, returning the number
    /// of bytes written.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;
}

/// Compressed frame → PCM, plus loss concealment.
pub trait FrameDecoder: Send {
    /// Decodes `payload` (or synthesizes concealment audio when `None`)
    /// into `out`, returning samples written per channel. `fec` requests
    /// in-band forward-error-correction data.
    fn decode(&mut self, payload: Option<&[u8]>, out: &mut [i16], fec: bool) -> Result<usize>;

    /// Samples per channel of the last decoded packet; sizes concealment
    /// buffers.
    fn last_packet_sample_count(&self) -> Result<usize>;
}

/// Builds encoder/decoder instances for a given format.
pub trait CodecFactory: Send + Sync {
    fn new_encoder(&self, format: &AudioFormat) -> Result<Box<dyn FrameEncoder>>;
    fn new_decoder(&self, format: &AudioFormat) -> Result<Box<dyn FrameDecoder>>;
}

/// Wraps the codec seam with the byte-level contracts the transport needs.
pub struct PacketCodec {
    format: AudioFormat,
    encoder: Box<dyn FrameEncoder>,
    scratch: Vec<i16>,
}

impl PacketCodec {
    pub fn new(factory: &dyn CodecFactory, format: AudioFormat) -> Result<Self> {
        Ok(Self {
            format,
            encoder: factory.new_encoder(&format)?,
            scratch: Vec::new(),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Encodes interleaved little-endian PCM bytes into `out`, returning
    /// bytes written.
    pub fn encode_frame(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<usize> {
        let samples = pcm.len() / 2;
        self.scratch.resize(samples, 0);
        LittleEndian::read_i16_into(pcm, &mut self.scratch);
        self.encoder.encode(&self.scratch, out)
    }

    /// Decodes one compressed frame to interleaved little-endian PCM bytes.
    pub fn decode_frame(
        format: &AudioFormat,
        decoder: &mut dyn FrameDecoder,
        payload: &[u8],
        fec: bool,
    ) -> Result<Vec<u8>> {
        let max_samples = format.samples_per_frame(MAX_PACKET_DURATION_MS);
        let mut pcm = vec![0i16; max_samples * format.channels() as usize];
        let samples = decoder.decode(Some(payload), &mut pcm, fec)?;
        Ok(to_bytes(&pcm[..samples * format.channels() as usize]))
    }

    /// Synthesizes one concealment frame from the decoder's prior state,
    /// sized by its last known packet sample count.
    pub fn conceal_loss(format: &AudioFormat, decoder: &mut dyn FrameDecoder) -> Result<Vec<u8>> {
        let samples = decoder.last_packet_sample_count()?;
        if samples == 0 {
            return Err(VoiceError::Codec("no prior packet to conceal from".into()));
        }
        let mut pcm = vec![0i16; samples * format.channels() as usize];
        let written = decoder.decode(None, &mut pcm, false)?;
        Ok(to_bytes(&pcm[..written * format.channels() as usize]))
    }
}

fn to_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(pcm, &mut bytes);
    bytes
}

/// In-crate fakes for exercising the transport without a native codec.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Encoder that emits the first bytes of the input, capped at 32 bytes.
    pub struct FakeEncoder;

    impl FrameEncoder for FakeEncoder {
        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
            let n = pcm.len().min(32).max(4).min(out.len());
            for (i, slot) in out.iter_mut().take(n).enumerate() {
                *slot = pcm.get(i).copied().unwrap_or(0) as u8;
            }
            Ok(n)
        }
    }

    /// Decoder that produces a fixed 20 ms of silence per call and counts
    /// concealment invocations.
    pub struct FakeDecoder {
        pub frame_samples: usize,
        pub decoded: usize,
        pub concealed: usize,
        pub fail_next: bool,
    }

    impl FakeDecoder {
        pub fn new(frame_samples: usize) -> Self {
            Self {
                frame_samples,
                decoded: 0,
                concealed: 0,
                fail_next: false,
            }
        }
    }

    impl FrameDecoder for FakeDecoder {
        fn decode(&mut self, payload: Option<&[u8]>, out: &mut [i16], _fec: bool) -> Result<usize> {
            if self.fail_next {
                self.fail_next = false;
                return Err(VoiceError::Codec("forced failure".into()));
            }
            match payload {
                Some(_) => self.decoded += 1,
                None => self.concealed += 1,
            }
            let n = self.frame_samples.min(out.len());
            out[..n].fill(0);
            Ok(self.frame_samples)
        }

        fn last_packet_sample_count(&self) -> Result<usize> {
            Ok(self.frame_samples)
        }
    }

    pub struct FakeCodecFactory;

    impl CodecFactory for FakeCodecFactory {
        fn new_encoder(&self, _format: &AudioFormat) -> Result<Box<dyn FrameEncoder>> {
            Ok(Box::new(FakeEncoder))
        }

        fn new_decoder(&self, format: &AudioFormat) -> Result<Box<dyn FrameDecoder>> {
            Ok(Box::new(FakeDecoder::new(format.samples_per_frame(20))))
        }
    }
}
