//! Opus implementation of the codec seam (feature `opus`).

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};

use crate::audio::codec::{CodecFactory, FrameDecoder, FrameEncoder};
use crate::audio::format::{AudioFormat, QualityPreset};
use crate::error::{Result, VoiceError};

fn map_err(e: audiopus::Error) -> VoiceError {
    VoiceError::Codec(e.to_string())
}

fn sample_rate(format: &AudioFormat) -> Result<SampleRate> {
    SampleRate::try_from(format.sample_rate() as i32).map_err(map_err)
}

fn channels(format: &AudioFormat) -> Result<Channels> {
    Channels::try_from(format.channels() as i32).map_err(map_err)
}

fn application(preset: QualityPreset) -> Application {
    match preset {
        QualityPreset::Voice => Application::Voip,
        QualityPreset::Music => Application::Audio,
        QualityPreset::LowLatency => Application::LowDelay,
    }
}

pub struct OpusFrameEncoder {
    encoder: OpusEncoder,
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        self.encoder.encode(pcm, out).map_err(map_err)
    }
}

pub struct OpusFrameDecoder {
    decoder: OpusDecoder,
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, payload: Option<&[u8]>, out: &mut [i16], fec: bool) -> Result<usize> {
        self.decoder.decode(payload, &mut out[..], fec).map_err(map_err)
    }

    fn last_packet_sample_count(&self) -> Result<usize> {
        self.decoder
            .last_packet_duration()
            .map(|d| d as usize)
            .map_err(map_err)
    }
}

/// Factory building Opus coders at the connection's negotiated format.
pub struct OpusCodecFactory;

impl CodecFactory for OpusCodecFactory {
    fn new_encoder(&self, format: &AudioFormat) -> Result<Box<dyn FrameEncoder>> {
        let encoder = OpusEncoder::new(
            sample_rate(format)?,
            channels(format)?,
            application(format.preset()),
        )
        .map_err(map_err)?;
        Ok(Box::new(OpusFrameEncoder { encoder }))
    }

    fn new_decoder(&self, format: &AudioFormat) -> Result<Box<dyn FrameDecoder>> {
        let decoder = OpusDecoder::new(sample_rate(format)?, channels(format)?).map_err(map_err)?;
        Ok(Box::new(OpusFrameDecoder { decoder }))
    }
}
