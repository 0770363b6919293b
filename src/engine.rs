//! The service object callers talk to.
//!
//! An [`AudioEngine`] is built once by the process entry point and handed to
//! whatever needs it (CLI command, IPC handler). It owns the playback clock,
//! so every mix and the continuous stream agree on where the music is.

use crate::audio::clock::{Clock, PlaybackClock, SystemClock};
use crate::classify::{AudioClassifier, ClassifierTap, Summary, TranscriptEntry};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EngineEvent, EventSender};
use crate::mixer::{DuckingController, MixOrchestrator, MixRequest, MixStream};
use crate::stream::{ContinuousStreamService, StreamState, StreamStatus};
use crate::synth::{CommandSynthesizer, SpeechSynthesizer};
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub struct AudioEngine {
    config: Config,
    clock: Arc<PlaybackClock>,
    orchestrator: MixOrchestrator,
    ducking: DuckingController,
    classifier: Option<AudioClassifier>,
    /// Replaced by a fresh service when started again after a stop.
    stream: Mutex<Arc<ContinuousStreamService>>,
    events: EventSender,
}

impl AudioEngine {
    /// Engine with the configured synthesis engines and the system clock.
    pub fn new(config: Config, events: EventSender) -> Result<Self> {
        let synthesizer = CommandSynthesizer::new(config.synth_settings(), events.clone());
        Self::with_parts(config, Arc::new(synthesizer), Arc::new(SystemClock), events)
    }

    /// Engine with an injected synthesizer and time source.
    ///
    /// Fails on invalid configuration, before any process is spawned.
    pub fn with_parts(
        config: Config,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Result<Self> {
        config.validate()?;
        let playback = Arc::new(PlaybackClock::with_clock(
            config.track.duration_secs,
            Arc::clone(&clock),
        )?);
        let orchestrator = MixOrchestrator::new(config.mixer_settings(), synthesizer, events.clone())
            .with_clock(Arc::clone(&playback));
        let ducking = DuckingController::new(
            config.ducking.ambient_level,
            config.ducking.level,
            events.clone(),
        );
        let classifier = config.classifier.enabled.then(|| {
            AudioClassifier::spawn(
                config.classifier(),
                config.classifier.queue,
                clock,
                events.clone(),
            )
        });

        let engine = Self {
            stream: Mutex::new(Arc::new(ContinuousStreamService::new(
                config.stream_settings(),
                orchestrator.clone(),
                Arc::clone(&playback),
                ducking.clone(),
                classifier.as_ref().map(AudioClassifier::tap),
                events.clone(),
            ))),
            config,
            clock: playback,
            orchestrator,
            ducking,
            classifier,
            events,
        };
        engine.events.emit(EngineEvent::ServiceStarted {
            track: engine
                .config
                .track
                .path
                .as_ref()
                .map(|p| p.display().to_string()),
            track_duration_secs: engine.clock.track_duration_secs(),
        });
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Seconds into the background track right now.
    pub fn current_offset(&self) -> f64 {
        self.clock.current_offset()
    }

    pub fn playback_clock(&self) -> &Arc<PlaybackClock> {
        &self.clock
    }

    /// Mixes `text` over the background track at the live offset.
    pub fn mix(
        &self,
        text: &str,
        background: Option<&Path>,
        ducking: bool,
        duck_level: f32,
    ) -> Result<MixStream> {
        let mut request = MixRequest::new(text)
            .with_ducking(ducking, duck_level)
            .with_format(self.config.output.format);
        if let Some(track) = background {
            request = request.with_track(track);
        }
        self.mix_request(&request)
    }

    pub fn mix_request(&self, request: &MixRequest) -> Result<MixStream> {
        let stream = self.orchestrator.mix(request, self.current_offset())?;
        Ok(stream.with_tap(self.tap().map(|tap| tap.with_text(&request.text))))
    }

    /// Plain background from the live offset, looping past the end of the
    /// track, optionally bounded to `seconds`.
    pub fn background_stream(&self, seconds: Option<f64>) -> Result<MixStream> {
        let stream = self.orchestrator.background(
            None,
            self.current_offset(),
            seconds,
            self.config.output.format,
            false,
        )?;
        Ok(stream.with_tap(self.tap()))
    }

    /// Queues speech for the continuous stream. Never blocks.
    pub fn enqueue_speech(&self, text: &str) -> bool {
        self.stream().enqueue_speech(text)
    }

    /// Starts the continuous stream. `Ok(false)` when already running.
    pub fn start(&self) -> Result<bool> {
        self.next_stream().start()
    }

    /// Stops the continuous stream and its background process.
    pub fn stop(&self) {
        self.stream().stop();
    }

    pub fn state(&self) -> StreamState {
        self.stream().state()
    }

    pub fn status(&self) -> StreamStatus {
        self.stream().status()
    }

    /// Raw PCM chunks of the continuous stream. Subscribing after a stop
    /// listens to the stream the next `start` runs.
    pub fn subscribe(&self) -> Receiver<Vec<u8>> {
        self.next_stream().subscribe()
    }

    /// Ducks the continuous stream, restoring after `duration` (or the
    /// configured default).
    pub fn duck_then_restore(&self, duration: Option<Duration>) -> Duration {
        let duration = duration.unwrap_or_else(|| self.config.duck_restore());
        self.ducking.duck_then_restore(duration);
        duration
    }

    pub fn ducking(&self) -> &DuckingController {
        &self.ducking
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.classifier
            .as_ref()
            .map(|c| c.transcript().entries())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> Summary {
        match &self.classifier {
            Some(classifier) => classifier.summary(),
            None => crate::classify::Transcript::new().summary(),
        }
    }

    /// Stops everything this engine started.
    pub fn shutdown(&self) {
        self.stop();
        self.events.emit(EngineEvent::ServiceStopped);
    }

    fn stream(&self) -> Arc<ContinuousStreamService> {
        Arc::clone(&lock(&self.stream))
    }

    /// The current stream, replaced by a fresh one once stopped.
    fn next_stream(&self) -> Arc<ContinuousStreamService> {
        let mut current = lock(&self.stream);
        if current.state() == StreamState::Stopped {
            *current = Arc::new(self.new_stream());
        }
        Arc::clone(&current)
    }

    fn tap(&self) -> Option<ClassifierTap> {
        self.classifier.as_ref().map(AudioClassifier::tap)
    }

    fn new_stream(&self) -> ContinuousStreamService {
        ContinuousStreamService::new(
            self.config.stream_settings(),
            self.orchestrator.clone(),
            Arc::clone(&self.clock),
            self.ducking.clone(),
            self.tap(),
            self.events.clone(),
        )
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("clock", &self.clock)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::ManualClock;
    use crate::audio::format::{AudioSpec, OutputFormat};
    use crate::audio::wav;
    use crate::error::BgmixError;
    use crate::synth::MockSynthesizer;
    use std::io::Read;

    fn engine(config: Config) -> (AudioEngine, ManualClock) {
        let clock = ManualClock::new();
        let synth = MockSynthesizer::with_silence(AudioSpec::default(), 200).unwrap();
        let engine = AudioEngine::with_parts(
            config,
            Arc::new(synth),
            Arc::new(clock.clone()),
            EventSender::disabled(),
        )
        .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = Config::default();
        config.track.duration_secs = -1.0;
        let err = AudioEngine::with_parts(
            config,
            Arc::new(MockSynthesizer::new(vec![])),
            Arc::new(ManualClock::new()),
            EventSender::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, BgmixError::ConfigInvalidValue { .. }));
    }

    #[test]
    fn test_offset_follows_clock_and_wraps() {
        let (engine, clock) = engine(Config::default());
        assert_eq!(engine.current_offset(), 0.0);
        clock.advance(Duration::from_secs(160));
        assert!((engine.current_offset() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mix_without_track_returns_speech() {
        let (engine, _clock) = engine(Config::default());
        let mut out = Vec::new();
        engine
            .mix("hello", None, false, 0.15)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        let header = wav::inspect(&out).unwrap();
        assert_eq!(header.spec, AudioSpec::default());
    }

    #[test]
    fn test_mix_with_missing_track_and_ducking_is_error() {
        let (engine, _clock) = engine(Config::default());
        let err = engine
            .mix("hello", Some(Path::new("/nonexistent/game.wav")), true, 0.15)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_background_without_track_is_error() {
        let (engine, _clock) = engine(Config::default());
        assert!(matches!(
            engine.background_stream(Some(1.0)).err().unwrap(),
            BgmixError::NoBackgroundTrack
        ));
    }

    #[test]
    fn test_start_without_track_is_error_and_state_idle() {
        let (engine, _clock) = engine(Config::default());
        assert!(engine.start().unwrap_err().is_configuration());
        assert_eq!(engine.state(), StreamState::Idle);
    }

    #[test]
    fn test_restart_after_stop_builds_new_stream() {
        let track = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(track.path(), wav::silence_wav(AudioSpec::default(), 100).unwrap()).unwrap();
        let mut config = Config::default();
        config.track.path = Some(track.path().to_path_buf());
        config.mixer.program = "/nonexistent/bgmix-mixer".to_string();
        config.stream.realtime = false;
        let (engine, _clock) = engine(config);

        assert!(engine.start().unwrap());
        assert!(!engine.start().unwrap());
        engine.stop();
        assert_eq!(engine.state(), StreamState::Stopped);

        assert!(engine.start().unwrap());
        assert_eq!(engine.state(), StreamState::Streaming);
        engine.shutdown();
        assert_eq!(engine.state(), StreamState::Stopped);
    }

    #[test]
    fn test_duck_uses_configured_default() {
        let (engine, _clock) = engine(Config::default());
        assert_eq!(engine.duck_then_restore(None), Duration::from_secs(3));
        assert!((engine.ducking().current_gain() - 0.15).abs() < 1e-6);
        assert!(engine.ducking().is_ducked());
    }

    #[test]
    fn test_transcript_empty_when_classifier_disabled() {
        let mut config = Config::default();
        config.classifier.enabled = false;
        config.output.format = OutputFormat::Pcm;
        let (engine, _clock) = engine(config);
        let mut out = Vec::new();
        engine
            .mix("hi", None, false, 0.0)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert!(engine.transcript().is_empty());
        assert_eq!(engine.summary().total_entries, 0);
    }
}
