//! Raw PCM format description
//!
//! The player never decodes: assets are interleaved PCM whose layout is
//! fixed up front by a [`PcmFormat`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_BITS_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::AudioError;

/// Byte order of multi-byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Layout of an interleaved PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcmFormat {
    pub sample_rate_hz: u32,
    /// 1 (mono) or 2 (stereo)
    pub channel_count: u8,
    pub bits_per_sample: u8,
    pub byte_order: ByteOrder,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE,
            channel_count: DEFAULT_CHANNELS,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            byte_order: ByteOrder::Little,
        }
    }
}

impl PcmFormat {
    pub fn new(sample_rate_hz: u32, channel_count: u8, bits_per_sample: u8) -> Self {
        Self {
            sample_rate_hz,
            channel_count,
            bits_per_sample,
            byte_order: ByteOrder::Little,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Check that the format describes whole-byte frames the player can stream
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate_hz == 0 {
            return Err(AudioError::UnsupportedFormat(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if !matches!(self.channel_count, 1 | 2) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (expected 1 or 2)",
                self.channel_count
            )));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} bits per sample",
                self.bits_per_sample
            )));
        }
        Ok(())
    }

    /// Bytes per sample of a single channel
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.channel_count as usize * self.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.sample_rate_hz as usize
    }

    /// Size in bytes of `duration` worth of whole frames
    pub fn bytes_for_duration(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate_hz as u128 * duration.as_micros() / 1_000_000) as usize;
        frames * self.frame_size()
    }

    /// Playback time of `bytes` bytes
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.frame_size().max(1)) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate_hz.max(1) as u64)
    }

    /// Round `bytes` down to a whole number of frames
    pub fn align_to_frame(&self, bytes: usize) -> usize {
        let frame = self.frame_size().max(1);
        bytes - bytes % frame
    }

    /// Decode one sample (exactly `bytes_per_sample` bytes) to [-1.0, 1.0).
    ///
    /// 8-bit PCM is unsigned, wider samples are signed two's complement.
    pub fn sample_to_f32(&self, bytes: &[u8]) -> f32 {
        let width = self.bytes_per_sample().min(bytes.len()).min(4);
        if width == 0 {
            return 0.0;
        }
        if width == 1 {
            return (bytes[0] as f32 - 128.0) / 128.0;
        }

        // Left-justify into an i32 so every width shares one scale
        let mut raw = [0u8; 4];
        match self.byte_order {
            ByteOrder::Little => raw[4 - width..].copy_from_slice(&bytes[..width]),
            ByteOrder::Big => {
                for (i, b) in bytes[..width].iter().enumerate() {
                    raw[3 - i] = *b;
                }
            }
        }
        let value = i32::from_le_bytes(raw);
        value as f32 / 2_147_483_648.0
    }
}
