use base64::Engine;
use std::time::Duration;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Shape of the raw PCM flowing through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bytes_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_mono(DEFAULT_SAMPLE_RATE)
    }
}

impl AudioFormat {
    /// 16-bit little-endian mono, the format every supported vendor speaks.
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bytes_per_sample: 2,
            channels: 1,
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.bytes_per_sample as u64 * self.channels as u64
    }

    /// Playback duration of `bytes` of audio, derived from sample arithmetic
    /// rather than the wall clock.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 1_000_000_000 / per_second as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Number of bytes that hold `ms` milliseconds of audio, rounded down to a
    /// whole frame.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let frame = self.bytes_per_sample as u64 * self.channels as u64;
        let raw = self.bytes_per_second() * ms / 1000;
        (raw - raw % frame.max(1)) as usize
    }
}

/// Decodes a base64 audio payload.
pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(fragment)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
