//! WAV helpers: silent clips, header inspection and header stripping.
//!
//! Streamed WAV (as written by ffmpeg or espeak to a pipe) carries
//! placeholder sizes, so inspection walks RIFF chunks instead of trusting
//! the length fields.

use crate::audio::format::AudioSpec;
use crate::error::{BgmixError, Result};
use std::io::{Cursor, Read};

/// Smallest possible canonical header: RIFF + fmt + data chunk headers.
pub const MIN_HEADER_LEN: usize = 44;

/// Sizes that streaming writers put in length fields they cannot know.
const UNKNOWN_SIZES: [u32; 2] = [0, u32::MAX];

/// Parsed WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub spec: AudioSpec,
    /// Byte offset of the first PCM byte.
    pub data_offset: usize,
    /// Declared data length, `None` when the writer streamed it.
    pub data_len: Option<u32>,
}

/// Builds a complete WAV file holding `millis` milliseconds of silence.
///
/// Header fields (sample rate, channels, bit depth, byte rate, block align
/// and sizes) are written by `hound`, so they are exact for `spec`.
pub fn silence_wav(spec: AudioSpec, millis: u32) -> Result<Vec<u8>> {
    let wav_spec = hound::WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (spec.sample_rate as u64 * millis as u64) / 1000;

    let mut cursor = Cursor::new(Vec::with_capacity(
        MIN_HEADER_LEN + spec.bytes_for_millis(millis),
    ));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec)?;
        for _ in 0..frames * spec.channels as u64 {
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Parses the header at the start of `bytes`.
///
/// Returns an error when `bytes` does not begin with a RIFF/WAVE header or
/// the header is incomplete.
pub fn inspect(bytes: &[u8]) -> Result<WavHeader> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(wav_error("missing RIFF/WAVE signature"));
    }

    let mut pos = 12;
    let mut spec = None;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4);
        let body = pos + 8;

        if id == b"fmt " {
            if body + 16 > bytes.len() {
                return Err(wav_error("truncated fmt chunk"));
            }
            let format_tag = read_u16(bytes, body);
            // 1 = PCM, 0xFFFE = WAVE_FORMAT_EXTENSIBLE
            if format_tag != 1 && format_tag != 0xFFFE {
                return Err(wav_error(&format!("unsupported format tag {format_tag}")));
            }
            spec = Some(AudioSpec {
                channels: read_u16(bytes, body + 2),
                sample_rate: read_u32(bytes, body + 4),
                bits_per_sample: read_u16(bytes, body + 14),
            });
        } else if id == b"data" {
            let spec = spec.ok_or_else(|| wav_error("data chunk before fmt chunk"))?;
            return Ok(WavHeader {
                spec,
                data_offset: body,
                data_len: (!UNKNOWN_SIZES.contains(&size)).then_some(size),
            });
        }

        // Chunks are word aligned
        pos = body + size as usize + (size as usize & 1);
    }

    Err(wav_error("incomplete header"))
}

/// Returns true when `bytes` begins like a WAV file.
pub fn looks_like_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decodes 16-bit little-endian samples. A trailing odd byte is ignored.
pub fn pcm_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Playback duration of a complete WAV byte buffer, ignoring declared sizes.
pub fn duration_secs(bytes: &[u8]) -> Result<f64> {
    let header = inspect(bytes)?;
    Ok(header
        .spec
        .duration_of(bytes.len().saturating_sub(header.data_offset)))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn wav_error(message: &str) -> BgmixError {
    BgmixError::Wav {
        message: message.to_string(),
    }
}

/// Reader adapter that drops a leading WAV header and yields raw PCM.
///
/// Input that does not start with a header passes through untouched.
pub struct HeaderStripper<R: Read> {
    inner: R,
    pending: Vec<u8>,
    pending_pos: usize,
    resolved: bool,
    header: Option<WavHeader>,
}

/// Upper bound on bytes buffered while looking for the data chunk.
const MAX_HEADER_SCAN: usize = 64 * 1024;

impl<R: Read> HeaderStripper<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pending_pos: 0,
            resolved: false,
            header: None,
        }
    }

    /// The header that was removed, once the first read has found one.
    pub fn header(&self) -> Option<&WavHeader> {
        self.header.as_ref()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn resolve(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            if self.pending.len() >= 12 && !looks_like_wav(&self.pending) {
                break;
            }
            if let Ok(header) = inspect(&self.pending) {
                self.pending_pos = header.data_offset.min(self.pending.len());
                self.header = Some(header);
                break;
            }
            if self.pending.len() >= MAX_HEADER_SCAN {
                break;
            }
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                // Stream ended inside the header: nothing playable follows
                if looks_like_wav(&self.pending) {
                    self.pending_pos = self.pending.len();
                }
                break;
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
        self.resolved = true;
        Ok(())
    }
}

impl<R: Read> Read for HeaderStripper<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if !self.resolved {
            self.resolve()?;
        }
        if self.pending_pos < self.pending.len() {
            let n = out.len().min(self.pending.len() - self.pending_pos);
            out[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            return Ok(n);
        }
        self.inner.read(out)
    }
}
