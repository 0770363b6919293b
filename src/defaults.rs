//! Default configuration constants for bgmix.
//!
//! Shared by the configuration types and the components that fall back to
//! them, so a value is only ever spelled out once.

/// Length of the default background track in seconds (2:39).
pub const TRACK_DURATION_SECS: f64 = 159.0;

/// Background gain while speech plays with ducking enabled.
///
/// 0.15 keeps the music audible as a bed without masking the voice.
pub const DUCK_LEVEL: f32 = 0.15;

/// Background gain when ducking is disabled, and between speech segments.
pub const AMBIENT_LEVEL: f32 = 0.35;

/// Gain applied to synthesized speech.
pub const FOREGROUND_GAIN: f32 = 1.0;

/// How long a time-bounded duck holds before the prior gain is restored.
pub const DUCK_RESTORE_SECS: f64 = 3.0;

/// Output sample rate in Hz.
///
/// 8kHz mono 16-bit is the telephony convention the stream is built for.
pub const SAMPLE_RATE: u32 = 8000;

/// Output channel count (mono).
pub const CHANNELS: u16 = 1;

/// Bits per output sample.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Size of each chunk handed to a consumer, in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Length of the silent clip produced when no speech engine is available.
pub const SILENCE_MS: u32 = 1000;

/// Speech rate passed to the synthesis engine (words per minute).
pub const SPEECH_RATE: u32 = 150;

/// Amplitude passed to the synthesis engine.
pub const SPEECH_AMPLITUDE: u32 = 100;

/// Voice variant passed to the synthesis engine.
pub const SPEECH_VOICE: &str = "en";

/// Mixing engine executable.
pub const MIXER_PROGRAM: &str = "ffmpeg";

/// Upper bound on the music-only segment used when speech synthesis fails outright.
pub const FALLBACK_BACKGROUND_SECS: f64 = 10.0;

/// Capacity of the pending-speech queue.
pub const SPEECH_QUEUE: usize = 64;

/// Chunks buffered per continuous-stream subscriber before chunks are dropped.
pub const SUBSCRIBER_BUFFER: usize = 32;

/// Capacity of the classifier input queue.
pub const CLASSIFIER_QUEUE: usize = 64;

/// Transcript entries kept in memory; the oldest go first.
pub const TRANSCRIPT_LIMIT: usize = 10_000;

/// Capacity of the structured event channel.
pub const EVENT_QUEUE: usize = 256;

/// Normalized RMS below which a chunk is classified as silence.
pub const SILENCE_THRESHOLD: f32 = 0.01;

/// File name of the IPC socket inside the runtime directory.
pub const SOCKET_NAME: &str = "bgmix.sock";
