//! Builds one mix pipeline per request: speech engine piped into the mixer,
//! background seeked to the live offset, degraded paths when either half fails.

use crate::audio::clock::PlaybackClock;
use crate::audio::format::{AudioSpec, OutputFormat};
use crate::audio::wav::HeaderStripper;
use crate::defaults;
use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, EventSender, FallbackKind};
use crate::mixer::ducking::{GainPolicy, MixParameters};
use crate::mixer::filter::{self, BackgroundArgs, MixArgs, MixMode};
use crate::mixer::stream::{MixStream, Source};
use crate::process::{PipeInput, SupervisedChild};
use crate::synth::SpeechSynthesizer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// One caller request. Consumed by [`MixOrchestrator::mix`].
#[derive(Debug, Clone, PartialEq)]
pub struct MixRequest {
    pub text: String,
    pub duck_level: f32,
    pub ducking_enabled: bool,
    /// Overrides the configured track for this request.
    pub background_track: Option<PathBuf>,
    pub output_format: OutputFormat,
    /// Pace the mixer at playback speed.
    pub realtime: bool,
}

impl MixRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            duck_level: defaults::DUCK_LEVEL,
            ducking_enabled: true,
            background_track: None,
            output_format: OutputFormat::default(),
            realtime: false,
        }
    }

    pub fn with_track(mut self, track: impl Into<PathBuf>) -> Self {
        self.background_track = Some(track.into());
        self
    }

    pub fn with_ducking(mut self, enabled: bool, duck_level: f32) -> Self {
        self.ducking_enabled = enabled;
        self.duck_level = duck_level;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

/// Mixer configuration shared by every request.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerSettings {
    pub program: String,
    pub mode: MixMode,
    /// Segment length in [`MixMode::LoopBackground`]; zero means "until the
    /// track wraps".
    pub loop_segment_secs: f64,
    /// Bound on the music-only segment served when speech fails.
    pub fallback_background_secs: f64,
    pub track_duration_secs: f64,
    pub default_track: Option<PathBuf>,
    pub gains: GainPolicy,
    pub spec: AudioSpec,
    pub chunk_size: usize,
    pub silence_ms: u32,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            program: defaults::MIXER_PROGRAM.to_string(),
            mode: MixMode::default(),
            loop_segment_secs: 0.0,
            fallback_background_secs: defaults::FALLBACK_BACKGROUND_SECS,
            track_duration_secs: defaults::TRACK_DURATION_SECS,
            default_track: None,
            gains: GainPolicy::default(),
            spec: AudioSpec::default(),
            chunk_size: defaults::CHUNK_SIZE,
            silence_ms: defaults::SILENCE_MS,
        }
    }
}

#[derive(Clone)]
pub(crate) struct OrchestratorInner {
    pub(crate) settings: MixerSettings,
    pub(crate) synthesizer: Arc<dyn SpeechSynthesizer>,
    pub(crate) events: EventSender,
    /// Where the music is now, for sources opened after a request started.
    pub(crate) clock: Option<Arc<PlaybackClock>>,
}

/// Everything a [`MixStream`] needs to rebuild a degraded source later.
pub(crate) struct FallbackPlan {
    pub(crate) inner: Arc<OrchestratorInner>,
    pub(crate) text: String,
    pub(crate) track: Option<PathBuf>,
    pub(crate) offset_secs: f64,
    pub(crate) format: OutputFormat,
    pub(crate) realtime: bool,
    pub(crate) started: Instant,
}

/// Spawns and wires mix pipelines. Cheap to clone.
#[derive(Clone)]
pub struct MixOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl MixOrchestrator {
    pub fn new(
        settings: MixerSettings,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                settings,
                synthesizer,
                events,
                clock: None,
            }),
        }
    }

    /// Reads the live offset from `clock` when a source has to be reopened
    /// in the middle of a request.
    pub fn with_clock(self, clock: Arc<PlaybackClock>) -> Self {
        let mut inner = (*self.inner).clone();
        inner.clock = Some(clock);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &MixerSettings {
        &self.inner.settings
    }

    /// Mixes `request` over the background track starting at `offset_secs`.
    ///
    /// Only configuration errors are returned: a missing track when ducking
    /// was requested. Engine failures degrade the stream instead (speech only,
    /// music only, or silence) and are reported as events.
    pub fn mix(&self, request: &MixRequest, offset_secs: f64) -> Result<MixStream> {
        let settings = &self.inner.settings;
        let events = &self.inner.events;
        let track = self.resolve_track(request)?;
        let plan = FallbackPlan {
            inner: Arc::clone(&self.inner),
            text: request.text.clone(),
            track: track.clone(),
            offset_secs,
            format: request.output_format,
            realtime: request.realtime,
            started: Instant::now(),
        };

        let speech = match self.inner.synthesizer.synthesize(&request.text) {
            Ok(speech) => speech,
            Err(e) => {
                events.emit(EngineEvent::Fallback {
                    kind: FallbackKind::BackgroundOnly,
                    reason: format!("speech synthesis failed: {e}"),
                });
                let source = match &track {
                    Some(_) => plan.background_source(),
                    None => plan.silence_source(),
                };
                return Ok(MixStream::new(plan, source));
            }
        };

        let Some(track_path) = track.as_deref() else {
            return Ok(MixStream::new(plan, Source::speech(speech, request.output_format)));
        };

        let params = settings
            .gains
            .compute(request.ducking_enabled, request.duck_level);
        let command = filter::mix_command(
            &settings.program,
            &MixArgs {
                track: track_path,
                offset_secs,
                params,
                mode: settings.mode,
                segment_secs: self.segment_secs(offset_secs),
                format: request.output_format,
                spec: settings.spec,
                realtime: request.realtime,
            },
        );

        let (input, synth_child) = speech.into_pipe_input();
        match SupervisedChild::spawn(&settings.program, &command, input) {
            Ok(mixer) => {
                events.emit(mix_started(offset_secs, params, settings.mode));
                Ok(MixStream::new(
                    plan,
                    Source::Mixed {
                        mixer,
                        synth: synth_child,
                    },
                ))
            }
            Err(e) => {
                // The speech pipe went down with the failed spawn; start over
                drop(synth_child);
                events.emit(EngineEvent::Fallback {
                    kind: FallbackKind::SpeechOnly,
                    reason: format!("mixer did not start: {e}"),
                });
                let source = plan.speech_source();
                Ok(MixStream::new(plan, source))
            }
        }
    }

    /// Music only, from `offset_secs`, looping past the end of the track.
    pub fn background(
        &self,
        track: Option<&Path>,
        offset_secs: f64,
        seconds: Option<f64>,
        format: OutputFormat,
        realtime: bool,
    ) -> Result<MixStream> {
        let track = self.existing_track(track)?;
        let gain = self.inner.settings.gains.ambient_level;
        let child = self.spawn_background(&track, offset_secs, gain, seconds, format, realtime)?;
        let plan = FallbackPlan {
            inner: Arc::clone(&self.inner),
            text: String::new(),
            track: Some(track),
            offset_secs,
            format,
            realtime,
            started: Instant::now(),
        };
        Ok(MixStream::new(plan, Source::Background(child)))
    }

    /// Spawns a background-only mixer process.
    pub fn spawn_background(
        &self,
        track: &Path,
        offset_secs: f64,
        gain: f32,
        seconds: Option<f64>,
        format: OutputFormat,
        realtime: bool,
    ) -> Result<SupervisedChild> {
        let settings = &self.inner.settings;
        let command = filter::background_command(
            &settings.program,
            &BackgroundArgs {
                track,
                offset_secs,
                gain,
                seconds,
                format,
                spec: settings.spec,
                realtime,
            },
        );
        let child = SupervisedChild::spawn(&settings.program, &command, PipeInput::Null)?;
        self.inner.events.emit(EngineEvent::BackgroundOpened { offset_secs, gain });
        Ok(child)
    }

    /// The request's track, else the configured one, checked on disk.
    fn resolve_track(&self, request: &MixRequest) -> Result<Option<PathBuf>> {
        let candidate = request
            .background_track
            .clone()
            .or_else(|| self.inner.settings.default_track.clone());

        match candidate {
            Some(path) if path.is_file() => Ok(Some(path)),
            Some(path) if request.ducking_enabled => Err(BgmixError::BackgroundTrackNotFound {
                path: path.display().to_string(),
            }),
            Some(path) => {
                self.inner.events.emit(EngineEvent::Fallback {
                    kind: FallbackKind::SpeechOnly,
                    reason: format!("background track not found at {}", path.display()),
                });
                Ok(None)
            }
            None => {
                self.inner.events.emit(EngineEvent::Fallback {
                    kind: FallbackKind::SpeechOnly,
                    reason: "no background track configured".to_string(),
                });
                Ok(None)
            }
        }
    }

    fn existing_track(&self, track: Option<&Path>) -> Result<PathBuf> {
        let path = track
            .map(Path::to_path_buf)
            .or_else(|| self.inner.settings.default_track.clone())
            .ok_or(BgmixError::NoBackgroundTrack)?;
        if !path.is_file() {
            return Err(BgmixError::BackgroundTrackNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }

    fn segment_secs(&self, offset_secs: f64) -> Option<f64> {
        let settings = &self.inner.settings;
        match settings.mode {
            MixMode::TruncateToSpeech => None,
            MixMode::LoopBackground if settings.loop_segment_secs > 0.0 => {
                Some(settings.loop_segment_secs)
            }
            MixMode::LoopBackground => Some((settings.track_duration_secs - offset_secs).max(0.001)),
        }
    }
}

impl FallbackPlan {
    /// Speech alone, re-synthesized. Silence when synthesis fails again.
    pub(crate) fn speech_source(&self) -> Source {
        match self.inner.synthesizer.synthesize(&self.text) {
            Ok(speech) => Source::speech(speech, self.format),
            Err(e) => {
                self.inner.events.emit(EngineEvent::warning(format!(
                    "speech synthesis failed again: {e}"
                )));
                self.background_source()
            }
        }
    }

    /// Music alone for a bounded time. Silence when that cannot run either.
    pub(crate) fn background_source(&self) -> Source {
        let Some(track) = self.track.as_deref() else {
            return self.silence_source();
        };
        match self.spawn_bounded_background(track, self.offset_secs) {
            Ok(child) => Source::Background(child),
            Err(e) => {
                self.inner.events.emit(EngineEvent::warning(format!(
                    "background fallback did not start: {e}"
                )));
                self.silence_source()
            }
        }
    }

    /// Music alone from the live offset, finishing a request whose mixer
    /// died after output had started. Carries no second WAV header.
    /// `None` when there is no track or the music cannot start.
    pub(crate) fn continuation_source(&self) -> Option<Source> {
        let track = self.track.as_deref()?;
        match self.spawn_bounded_background(track, self.live_offset()) {
            Ok(child) => Some(match self.format {
                OutputFormat::Wav => Source::Resumed(HeaderStripper::new(child)),
                OutputFormat::Pcm | OutputFormat::Mp3 => Source::Background(child),
            }),
            Err(e) => {
                self.inner.events.emit(EngineEvent::warning(format!(
                    "background continuation did not start: {e}"
                )));
                None
            }
        }
    }

    fn spawn_bounded_background(&self, track: &Path, offset_secs: f64) -> Result<SupervisedChild> {
        let settings = &self.inner.settings;
        let command = filter::background_command(
            &settings.program,
            &BackgroundArgs {
                track,
                offset_secs,
                gain: settings.gains.ambient_level,
                seconds: Some(settings.fallback_background_secs),
                format: self.format,
                spec: settings.spec,
                realtime: self.realtime,
            },
        );
        let child = SupervisedChild::spawn(&settings.program, &command, PipeInput::Null)?;
        self.inner.events.emit(EngineEvent::BackgroundOpened {
            offset_secs,
            gain: settings.gains.ambient_level,
        });
        Ok(child)
    }

    /// The playback clock's offset, else the request's offset moved on by
    /// the wall time since it started.
    fn live_offset(&self) -> f64 {
        if let Some(clock) = &self.inner.clock {
            return clock.current_offset();
        }
        let duration = self.inner.settings.track_duration_secs;
        let offset = self.offset_secs + self.started.elapsed().as_secs_f64();
        if duration > 0.0 { offset % duration } else { offset }
    }

    /// Last resort: a silent clip in the configured layout.
    pub(crate) fn silence_source(&self) -> Source {
        let settings = &self.inner.settings;
        self.inner.events.emit(EngineEvent::SilenceFallback {
            millis: settings.silence_ms,
        });
        Source::silence(settings.spec, settings.silence_ms, self.format)
    }
}

fn mix_started(offset_secs: f64, params: MixParameters, mode: MixMode) -> EngineEvent {
    EngineEvent::MixStarted {
        offset_secs,
        background_gain: params.background_gain,
        foreground_gain: params.foreground_gain,
        mode,
    }
}
