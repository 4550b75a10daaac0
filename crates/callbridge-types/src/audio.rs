//! Audio format and frame definitions.
//!
//! Every chunk of audio that crosses a component boundary carries its
//! [`AudioFormat`] so that no stage has to guess how to interpret bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sample rate used by the carrier media stream.
pub const CARRIER_SAMPLE_RATE: u32 = 8_000;

/// Duration of one outbound carrier frame in milliseconds.
pub const CARRIER_FRAME_MS: u32 = 20;

/// Sample encodings understood by the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// G.711 µ-law, one byte per sample.
    Mulaw,
    /// Signed 16-bit little-endian linear PCM.
    Pcm16,
}

impl AudioEncoding {
    /// Bytes occupied by a single sample of a single channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Mulaw => 1,
            Self::Pcm16 => 2,
        }
    }

    /// Returns the identifier recognition providers expect in a handshake.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mulaw => "MULAW",
            Self::Pcm16 => "LINEAR16",
        }
    }
}

/// Encoding, sample rate and channel count of a stretch of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channels,
        }
    }

    /// 8 kHz mono µ-law, the carrier wire format.
    pub const fn carrier() -> Self {
        Self::new(AudioEncoding::Mulaw, CARRIER_SAMPLE_RATE, 1)
    }

    /// Mono 16-bit PCM at the given rate.
    pub const fn pcm16(sample_rate: u32) -> Self {
        Self::new(AudioEncoding::Pcm16, sample_rate, 1)
    }

    /// Size in bytes of one sample across all channels.
    pub fn frame_width(&self) -> usize {
        self.encoding.bytes_per_sample() * usize::from(self.channels)
    }

    /// Number of bytes needed to hold `ms` milliseconds of audio.
    pub fn bytes_for_millis(&self, ms: u32) -> usize {
        (self.sample_rate as usize * ms as usize / 1000) * self.frame_width()
    }

    /// Checks that the format is something the transcoder can work with.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(FormatError::UnsupportedChannels(self.channels));
        }
        Ok(())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}Hz/{}ch",
            self.encoding.as_str(),
            self.sample_rate,
            self.channels
        )
    }
}

/// Reasons an [`AudioFormat`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
}

/// A chunk of audio together with its format and arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Position in the stream that produced this frame, by receipt order.
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, format: AudioFormat, sequence: u64) -> Self {
        Self {
            data,
            format,
            sequence,
        }
    }

    /// Number of samples per channel held by this frame.
    pub fn sample_count(&self) -> usize {
        match self.format.frame_width() {
            0 => 0,
            width => self.data.len() / width,
        }
    }

    /// Playback duration in microseconds.
    pub fn duration_micros(&self) -> u64 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        self.sample_count() as u64 * 1_000_000 / u64::from(self.format.sample_rate)
    }
}
