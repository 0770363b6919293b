//! bgmix - background music mixing and speech ducking
//!
//! Mixes synthesized speech over a continuously playing background track,
//! one-shot or as an endless stream, by wiring external speech and mixing
//! engines together through process pipes.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod app;
pub mod classify;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod daemon;
pub mod defaults;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod ipc;
pub mod mixer;
pub mod output;
pub mod process;
pub mod stream;
pub mod synth;

// Position tracking
pub use audio::clock::{Clock, ManualClock, PlaybackClock, SystemClock};
pub use audio::format::{AudioSpec, OutputFormat};

// Service surface
pub use engine::AudioEngine;
pub use mixer::{DuckingController, MixMode, MixOrchestrator, MixRequest, MixStream};
pub use stream::{ContinuousStreamService, StreamState, StreamStatus};
pub use synth::{CommandSynthesizer, MockSynthesizer, SpeechSynthesizer};

// Classification
pub use classify::{AudioClassifier, AudioType, Classifier, Transcript, TranscriptEntry};

// Error handling
pub use error::{BgmixError, Result};

// Config
pub use config::Config;

// Events
pub use events::{EngineEvent, EventSender};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
