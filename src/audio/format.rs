//! Output container formats and PCM parameters.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Container the mixing engine writes to its standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// RIFF/WAVE, 16-bit little-endian PCM.
    #[default]
    Wav,
    /// MPEG layer III.
    Mp3,
    /// Headerless signed 16-bit little-endian PCM. Used for the continuous
    /// stream so consecutive segments concatenate cleanly.
    Pcm,
}

impl OutputFormat {
    /// Value for the mixing engine's `-f` flag.
    pub fn muxer(self) -> &'static str {
        match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Pcm => "s16le",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Wav => "audio/wav",
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Pcm => "audio/L16",
        }
    }

    /// Whether chunks of this format start with a WAV header.
    pub fn has_wav_header(self) -> bool {
        matches!(self, OutputFormat::Wav)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Pcm => "pcm",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(OutputFormat::Wav),
            "mp3" => Ok(OutputFormat::Mp3),
            "pcm" | "s16le" | "raw" => Ok(OutputFormat::Pcm),
            other => Err(format!("unknown output format '{other}' (expected wav, mp3 or pcm)")),
        }
    }
}

/// PCM layout of the produced audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioSpec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: defaults::BITS_PER_SAMPLE,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Playback duration of `bytes` bytes of raw PCM in this layout.
    pub fn duration_of(&self, bytes: usize) -> f64 {
        let rate = self.byte_rate();
        if rate == 0 {
            return 0.0;
        }
        bytes as f64 / rate as f64
    }

    /// Number of PCM bytes covering `millis` milliseconds, frame aligned.
    pub fn bytes_for_millis(&self, millis: u32) -> usize {
        let frames = (self.sample_rate as u64 * millis as u64) / 1000;
        frames as usize * self.block_align() as usize
    }
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self::new(defaults::SAMPLE_RATE, defaults::CHANNELS)
    }
}

impl fmt::Display for AudioSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}
