//! Validated audio format descriptor and the buffer-size math derived
//! from it.

use crate::constants::MAX_PACKET_DURATION_MS;
use crate::error::{Result, VoiceError};

/// Sample rates the transport accepts (Hz).
pub const ALLOWED_SAMPLE_RATES: &[u32] = &[8_000, 12_000, 16_000, 24_000, 48_000];

/// Channel counts the transport accepts.
pub const ALLOWED_CHANNELS: &[u8] = &[1, 2];

/// Frame durations (ms) accepted by the public sample-size calculator.
pub const ALLOWED_FRAME_DURATIONS_MS: &[u32] = &[5, 10, 20, 40, 60];

/// Encoder quality preset. Opaque to the transport itself; forwarded to
/// the codec seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QualityPreset {
    Voice,
    Music,
    LowLatency,
}

/// Immutable {sample rate, channel count, quality preset} tuple.
///
/// Constructed once through [`AudioFormat::new`], never mutated. All size
/// calculations are pure functions of the three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    sample_rate: u32,
    channels: u8,
    preset: QualityPreset,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            preset: QualityPreset::Music,
        }
    }
}

impl AudioFormat {
    /// Validates and constructs a format. Fails with `InvalidParameter` if
    /// any field is outside its allowed set; no partially constructed
    /// value is observable.
    pub fn new(sample_rate: u32, channels: u8, preset: QualityPreset) -> Result<Self> {
        if !ALLOWED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(VoiceError::InvalidParameter("sample rate"));
        }
        if !ALLOWED_CHANNELS.contains(&channels) {
            return Err(VoiceError::InvalidParameter("channel count"));
        }
        Ok(Self {
            sample_rate,
            channels,
            preset,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn preset(&self) -> QualityPreset {
        self.preset
    }

    /// PCM byte size of one frame of `duration_ms`, for the public set of
    /// frame durations: `duration * channels * (rate / 1000) * 2`.
    pub fn sample_size(&self, duration_ms: u32) -> Result<usize> {
        if !ALLOWED_FRAME_DURATIONS_MS.contains(&duration_ms) {
            return Err(VoiceError::InvalidParameter("frame duration"));
        }
        Ok(self.frame_bytes(duration_ms))
    }

    /// Internal byte-size conversion for arbitrary integral durations.
    pub(crate) fn frame_bytes(&self, duration_ms: u32) -> usize {
        duration_ms as usize * self.channels as usize * (self.sample_rate as usize / 1_000) * 2
    }

    /// Samples per channel in a frame of `duration_ms`.
    pub fn samples_per_frame(&self, duration_ms: u32) -> usize {
        (self.sample_rate as usize / 1_000) * duration_ms as usize
    }

    /// Largest single-packet PCM buffer: 120 ms worth of audio.
    pub fn max_buffer_size(&self) -> usize {
        self.frame_bytes(MAX_PACKET_DURATION_MS)
    }

    /// Interleaved byte size of `samples` samples per channel.
    pub fn samples_to_bytes(&self, samples: usize) -> usize {
        samples * self.channels as usize * 2
    }

    /// Samples per channel contained in `bytes` of interleaved PCM.
    pub fn bytes_to_samples(&self, bytes: usize) -> usize {
        bytes / 2 / self.channels as usize
    }

    /// Nominal duration (ms) of `bytes` of interleaved PCM.
    pub fn bytes_to_duration_ms(&self, bytes: usize) -> u32 {
        (self.bytes_to_samples(bytes) / (self.sample_rate as usize / 1_000)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_matches_formula_for_all_valid_inputs() {
        for &rate in ALLOWED_SAMPLE_RATES {
            for &channels in ALLOWED_CHANNELS {
                let format = AudioFormat::new(rate, channels, QualityPreset::Voice).unwrap();
                for &duration in ALLOWED_FRAME_DURATIONS_MS {
                    let expected =
                        duration as usize * channels as usize * (rate as usize / 1_000) * 2;
                    assert_eq!(format.sample_size(duration).unwrap(), expected);
                    // Deterministic across calls.
                    assert_eq!(format.sample_size(duration).unwrap(), expected);
                }
            }
        }
    }

    #[test]
    fn rejects_out_of_set_fields() {
        assert!(matches!(
            AudioFormat::new(44_100, 2, QualityPreset::Music),
            Err(VoiceError::InvalidParameter("sample rate"))
        ));
        assert!(matches!(
            AudioFormat::new(48_000, 3, QualityPreset::Music),
            Err(VoiceError::InvalidParameter("channel count"))
        ));
        assert!(matches!(
            AudioFormat::new(0, 0, QualityPreset::LowLatency),
            Err(VoiceError::InvalidParameter("sample rate"))
        ));
    }

    #[test]
    fn rejects_out_of_set_durations() {
        let format = AudioFormat::default();
        for bad in [0, 1, 15, 25, 120] {
            assert!(format.sample_size(bad).is_err());
        }
    }

    #[test]
    fn conversions_round_trip() {
        let format = AudioFormat::new(48_000, 2, QualityPreset::Music).unwrap();
        assert_eq!(format.samples_per_frame(20), 960);
        assert_eq!(format.samples_to_bytes(960), 3_840);
        assert_eq!(format.bytes_to_samples(3_840), 960);
        assert_eq!(format.bytes_to_duration_ms(3_840), 20);
        assert_eq!(format.max_buffer_size(), format.frame_bytes(120));
    }

    #[test]
    fn mono_low_rate_math() {
        let format = AudioFormat::new(8_000, 1, QualityPreset::Voice).unwrap();
        assert_eq!(format.sample_size(20).unwrap(), 320);
        assert_eq!(format.samples_per_frame(60), 480);
        assert_eq!(format.bytes_to_duration_ms(320), 20);
    }
}
