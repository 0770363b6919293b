use crate::audio::format::{AudioSpec, OutputFormat};
use crate::classify::Classifier;
use crate::defaults;
use crate::error::{BgmixError, Result};
use crate::mixer::{GainPolicy, MixMode, MixerSettings};
use crate::stream::StreamSettings;
use crate::synth::{EngineSpec, SynthSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub track: TrackConfig,
    pub ducking: DuckingConfig,
    pub output: OutputConfig,
    pub synth: SynthConfig,
    pub mixer: MixerConfig,
    pub stream: StreamConfig,
    pub classifier: ClassifierConfig,
}

/// Background track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DuckingConfig {
    pub enabled: bool,
    /// Background gain under speech.
    pub level: f32,
    /// Background gain without ducking.
    pub ambient_level: f32,
    pub restore_after_secs: f64,
}

/// Audio delivered to callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: usize,
}

/// Text-to-speech engines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthConfig {
    pub rate: u32,
    pub amplitude: u32,
    pub voice: String,
    pub silence_ms: u32,
    /// Tried in order; the first one that starts wins.
    pub engines: Vec<EngineSpec>,
}

/// Mixing engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixerConfig {
    pub program: String,
    pub mode: MixMode,
    pub loop_segment_secs: f64,
    pub fallback_background_secs: f64,
}

/// Continuous stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Start the loop when the daemon starts.
    pub autostart: bool,
    pub speech_queue: usize,
    pub subscriber_buffer: usize,
    pub realtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub queue: usize,
    pub silence_threshold: f32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            path: None,
            duration_secs: defaults::TRACK_DURATION_SECS,
        }
    }
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: defaults::DUCK_LEVEL,
            ambient_level: defaults::AMBIENT_LEVEL,
            restore_after_secs: defaults::DUCK_RESTORE_SECS,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            chunk_size: defaults::CHUNK_SIZE,
        }
    }
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            rate: defaults::SPEECH_RATE,
            amplitude: defaults::SPEECH_AMPLITUDE,
            voice: defaults::SPEECH_VOICE.to_string(),
            silence_ms: defaults::SILENCE_MS,
            engines: EngineSpec::default_chain(),
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            program: defaults::MIXER_PROGRAM.to_string(),
            mode: MixMode::default(),
            loop_segment_secs: 0.0,
            fallback_background_secs: defaults::FALLBACK_BACKGROUND_SECS,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            speech_queue: defaults::SPEECH_QUEUE,
            subscriber_buffer: defaults::SUBSCRIBER_BUFFER,
            realtime: true,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue: defaults::CLASSIFIER_QUEUE,
            silence_threshold: defaults::SILENCE_THRESHOLD,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - BGMIX_TRACK → track.path
    /// - BGMIX_TRACK_DURATION → track.duration_secs
    /// - BGMIX_DUCK_LEVEL → ducking.level
    /// - BGMIX_MIXER → mixer.program
    /// - BGMIX_FORMAT → output.format
    ///
    /// Empty values are ignored; unparseable ones are an error.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(track) = env_value("BGMIX_TRACK") {
            self.track.path = Some(PathBuf::from(track));
        }

        if let Some(duration) = env_value("BGMIX_TRACK_DURATION") {
            self.track.duration_secs = duration
                .parse()
                .map_err(|_| BgmixError::invalid("BGMIX_TRACK_DURATION", format!("not a number: {duration}")))?;
        }

        if let Some(level) = env_value("BGMIX_DUCK_LEVEL") {
            self.ducking.level = level
                .parse()
                .map_err(|_| BgmixError::invalid("BGMIX_DUCK_LEVEL", format!("not a number: {level}")))?;
        }

        if let Some(mixer) = env_value("BGMIX_MIXER") {
            self.mixer.program = mixer;
        }

        if let Some(format) = env_value("BGMIX_FORMAT") {
            self.output.format = format
                .parse()
                .map_err(|e: String| BgmixError::invalid("BGMIX_FORMAT", e))?;
        }

        Ok(self)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/bgmix/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("bgmix")
            .join("config.toml")
    }

    /// Rejects values that would only fail later, mid-stream.
    pub fn validate(&self) -> Result<()> {
        let duration = self.track.duration_secs;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(BgmixError::invalid(
                "track.duration_secs",
                format!("must be a positive number of seconds, got {duration}"),
            ));
        }
        check_gain("ducking.level", self.ducking.level)?;
        check_gain("ducking.ambient_level", self.ducking.ambient_level)?;
        check_secs("ducking.restore_after_secs", self.ducking.restore_after_secs)?;
        check_secs("mixer.loop_segment_secs", self.mixer.loop_segment_secs)?;
        check_secs(
            "mixer.fallback_background_secs",
            self.mixer.fallback_background_secs,
        )?;
        if self.output.sample_rate == 0 {
            return Err(BgmixError::invalid("output.sample_rate", "must be greater than 0"));
        }
        if !(1..=2).contains(&self.output.channels) {
            return Err(BgmixError::invalid(
                "output.channels",
                format!("must be 1 or 2, got {}", self.output.channels),
            ));
        }
        if self.output.chunk_size == 0 {
            return Err(BgmixError::invalid("output.chunk_size", "must be greater than 0"));
        }
        if self.mixer.program.trim().is_empty() {
            return Err(BgmixError::invalid("mixer.program", "must not be empty"));
        }
        for (key, value) in [
            ("stream.speech_queue", self.stream.speech_queue),
            ("stream.subscriber_buffer", self.stream.subscriber_buffer),
            ("classifier.queue", self.classifier.queue),
        ] {
            if value == 0 {
                return Err(BgmixError::invalid(key, "must hold at least one item"));
            }
        }
        Ok(())
    }

    /// Look up a dotted key such as `track.duration_secs`.
    pub fn get_value_by_path(&self, key: &str) -> Result<String> {
        let root = toml::Value::try_from(self).map_err(|e| BgmixError::ConfigParse {
            message: e.to_string(),
        })?;
        let mut current = &root;
        for part in key.split('.') {
            current = match current {
                toml::Value::Table(table) => table.get(part),
                toml::Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| BgmixError::invalid(key, "no such configuration key"))?;
        }
        Ok(match current {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// The whole configuration as TOML, defaults filled in.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BgmixError::ConfigParse {
            message: e.to_string(),
        })
    }

    pub fn audio_spec(&self) -> AudioSpec {
        AudioSpec::new(self.output.sample_rate, self.output.channels)
    }

    pub fn mixer_settings(&self) -> MixerSettings {
        MixerSettings {
            program: self.mixer.program.clone(),
            mode: self.mixer.mode,
            loop_segment_secs: self.mixer.loop_segment_secs,
            fallback_background_secs: self.mixer.fallback_background_secs,
            track_duration_secs: self.track.duration_secs,
            default_track: self.track.path.clone(),
            gains: GainPolicy::new(self.ducking.ambient_level),
            spec: self.audio_spec(),
            chunk_size: self.output.chunk_size,
            silence_ms: self.synth.silence_ms,
        }
    }

    pub fn synth_settings(&self) -> SynthSettings {
        SynthSettings {
            rate: self.synth.rate,
            amplitude: self.synth.amplitude,
            voice: self.synth.voice.clone(),
            silence_ms: self.synth.silence_ms,
            spec: self.audio_spec(),
            engines: self.synth.engines.clone(),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            track: self.track.path.clone(),
            ducking_enabled: self.ducking.enabled,
            speech_queue: self.stream.speech_queue,
            subscriber_buffer: self.stream.subscriber_buffer,
            realtime: self.stream.realtime,
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.classifier.silence_threshold)
    }

    pub fn duck_restore(&self) -> Duration {
        Duration::from_secs_f64(self.ducking.restore_after_secs.max(0.0))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn check_gain(key: &str, gain: f32) -> Result<()> {
    if gain.is_finite() && (0.0..=1.0).contains(&gain) {
        Ok(())
    } else {
        Err(BgmixError::invalid(key, format!("must be between 0.0 and 1.0, got {gain}")))
    }
}

fn check_secs(key: &str, secs: f64) -> Result<()> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(BgmixError::invalid(key, format!("must be a non-negative number of seconds, got {secs}")))
    }
}
