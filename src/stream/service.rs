//! The long-running loop behind the continuous stream.
//!
//! One worker thread owns the loop. It reads background chunks from a single
//! background child, and whenever speech is pending it replaces that child
//! with a mix pipeline seeked to the live offset, then reopens the
//! background wherever the playback clock says the music is now.

use crate::audio::clock::PlaybackClock;
use crate::audio::format::OutputFormat;
use crate::classify::{ChunkOrigin, ClassifierTap};
use crate::defaults;
use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, EventSender};
use crate::mixer::{DuckingController, MixOrchestrator, MixRequest};
use crate::process::{KillSwitch, SupervisedChild};
use crate::stream::{StreamState, StreamStatus};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub track: Option<PathBuf>,
    /// Duck the background under spliced speech.
    pub ducking_enabled: bool,
    pub speech_queue: usize,
    pub subscriber_buffer: usize,
    /// Pace background and mixes at playback speed.
    pub realtime: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            track: None,
            ducking_enabled: true,
            speech_queue: defaults::SPEECH_QUEUE,
            subscriber_buffer: defaults::SUBSCRIBER_BUFFER,
            realtime: true,
        }
    }
}

struct Shared {
    settings: StreamSettings,
    orchestrator: MixOrchestrator,
    clock: Arc<PlaybackClock>,
    ducking: DuckingController,
    tap: Option<ClassifierTap>,
    events: EventSender,
    running: AtomicBool,
    state: Mutex<StreamState>,
    speech_tx: Sender<String>,
    speech_rx: Receiver<String>,
    subscribers: Mutex<Vec<Sender<Vec<u8>>>>,
    /// The one background child; `stop` kills it from outside the loop.
    background: Mutex<Option<SupervisedChild>>,
    /// Reaches the children of an in-flight splice, which live on the
    /// worker's stack.
    splice_kill: KillSwitch,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Dropped on stop to wake the loop out of a retry pause.
    shutdown: Sender<()>,
}

/// Continuous stream of background audio, raw PCM, with speech spliced in.
///
/// Chunks go to every subscriber; a subscriber that falls behind misses
/// chunks rather than slowing the stream down.
pub struct ContinuousStreamService {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ContinuousStreamService {
    pub fn new(
        settings: StreamSettings,
        orchestrator: MixOrchestrator,
        clock: Arc<PlaybackClock>,
        ducking: DuckingController,
        tap: Option<ClassifierTap>,
        events: EventSender,
    ) -> Self {
        let (speech_tx, speech_rx) = bounded(settings.speech_queue.max(1));
        Self {
            shared: Arc::new(Shared {
                settings,
                orchestrator,
                clock,
                ducking,
                tap,
                events,
                running: AtomicBool::new(false),
                state: Mutex::new(StreamState::Idle),
                speech_tx,
                speech_rx,
                subscribers: Mutex::new(Vec::new()),
                background: Mutex::new(None),
                splice_kill: KillSwitch::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the loop. Returns `Ok(false)` if it was already running.
    ///
    /// The background track is checked here, so a missing file is reported
    /// to the caller instead of turning into a retry loop.
    pub fn start(&self) -> Result<bool> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(false);
        }
        if self.state() == StreamState::Stopped {
            return Err(BgmixError::StreamStopped);
        }
        let track = self.shared.track()?;

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(StreamState::Streaming);

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("bgmix-stream".to_string())
            .spawn(move || shared.run(&track, &shutdown_rx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_state(StreamState::Idle);
                return Err(BgmixError::Io(e));
            }
        };
        *worker = Some(Worker {
            handle,
            shutdown: shutdown_tx,
        });
        Ok(true)
    }

    /// Stops the loop, kills the background child and any splice in
    /// flight, and waits for the worker.
    /// Idempotent; the stream cannot be restarted afterwards.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.splice_kill.trip();
        if let Some(mut child) = lock(&self.shared.background).take() {
            child.terminate();
        }
        if let Some(Worker { handle, shutdown }) = worker.take() {
            drop(shutdown);
            if handle.join().is_err() {
                self.shared
                    .events
                    .emit(EngineEvent::warning("stream worker panicked"));
            }
        }
        // Ends every subscriber's receive loop
        lock(&self.shared.subscribers).clear();
        self.shared.set_state(StreamState::Stopped);
    }

    /// Queues `text` to be mixed into the stream. Never blocks.
    ///
    /// Returns false (and emits `SpeechDropped`) when the text is empty,
    /// the queue is full, or the stream is stopped.
    pub fn enqueue_speech(&self, text: &str) -> bool {
        let text = text.trim();
        let reject = |reason: &str| {
            self.shared.events.emit(EngineEvent::SpeechDropped {
                text: text.to_string(),
                reason: reason.to_string(),
            });
            false
        };
        if text.is_empty() {
            return reject("empty text");
        }
        if self.state() == StreamState::Stopped {
            return reject("stream stopped");
        }
        match self.shared.speech_tx.try_send(text.to_string()) {
            Ok(()) => {
                self.shared.events.emit(EngineEvent::SpeechQueued {
                    text: text.to_string(),
                    pending: self.shared.speech_rx.len(),
                });
                true
            }
            Err(TrySendError::Full(_)) => reject("speech queue full"),
            Err(TrySendError::Disconnected(_)) => reject("speech queue closed"),
        }
    }

    /// New receiver of stream chunks.
    pub fn subscribe(&self) -> Receiver<Vec<u8>> {
        let (tx, rx) = bounded(self.shared.settings.subscriber_buffer.max(1));
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.shared.speech_rx.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    pub fn ducking(&self) -> &DuckingController {
        &self.shared.ducking
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            running: self.is_running(),
            state: self.state(),
            pending: self.pending(),
            track: self.shared.settings.track.clone(),
            offset_secs: self.shared.clock.current_offset(),
            track_duration_secs: self.shared.clock.track_duration_secs(),
            gain: self.shared.ducking.current_gain(),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Drop for ContinuousStreamService {
    fn drop(&mut self) {
        if lock(&self.worker).is_some() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for ContinuousStreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousStreamService")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Shared {
    fn run(&self, track: &Path, shutdown: &Receiver<()>) {
        let mut backoff = RETRY_INITIAL;
        let mut background: Option<(ChildStdout, f32)> = None;
        let mut pending: Option<String> = None;

        while self.running.load(Ordering::SeqCst) {
            if let Some(text) = pending.take().or_else(|| self.speech_rx.try_recv().ok()) {
                background = None;
                self.kill_background();
                self.splice(track, &text);
                continue;
            }

            let gain = self.ducking.current_gain();
            if background.as_ref().is_some_and(|(_, opened_at)| *opened_at != gain) {
                background = None;
                self.kill_background();
            }

            if background.is_none() {
                match self.open_background(track, gain) {
                    Ok(Some(stdout)) => {
                        backoff = RETRY_INITIAL;
                        background = Some((stdout, gain));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.events
                            .emit(EngineEvent::warning(format!("background source failed: {e}")));
                        pending = self.pause(shutdown, &mut backoff);
                        continue;
                    }
                }
            }
            let Some((stdout, _)) = background.as_mut() else {
                continue;
            };

            match read_chunk(stdout, self.orchestrator.settings().chunk_size) {
                Ok(chunk) if !chunk.is_empty() => {
                    if let Some(tap) = &self.tap {
                        tap.offer(&chunk, ChunkOrigin::Background, true);
                    }
                    self.broadcast(chunk);
                }
                result => {
                    background = None;
                    self.kill_background();
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let reason = match result {
                        Err(e) => e.to_string(),
                        Ok(_) => "end of output".to_string(),
                    };
                    self.events
                        .emit(EngineEvent::warning(format!("background source ended: {reason}")));
                    pending = self.pause(shutdown, &mut backoff);
                }
            }
        }

        self.kill_background();
    }

    /// Mixes one speech request into the stream, then returns to streaming.
    fn splice(&self, track: &Path, text: &str) {
        self.set_state(StreamState::Mixing);
        let request = MixRequest::new(text)
            .with_track(track)
            .with_ducking(self.settings.ducking_enabled, self.ducking.duck_level())
            .with_format(OutputFormat::Pcm)
            .realtime(self.settings.realtime);

        match self.orchestrator.mix(&request, self.clock.current_offset()) {
            Ok(stream) => {
                let mut stream = stream
                    .with_tap(self.tap.as_ref().map(|tap| tap.with_text(text)))
                    .with_kill_switch(self.splice_kill.clone());
                loop {
                    if !self.running.load(Ordering::SeqCst) {
                        stream.cancel();
                        break;
                    }
                    match stream.next_chunk() {
                        Ok(Some(chunk)) => self.broadcast(chunk),
                        Ok(None) => break,
                        Err(e) => {
                            self.events
                                .emit(EngineEvent::warning(format!("mix segment failed: {e}")));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                self.events
                    .emit(EngineEvent::warning(format!("speech not mixed: {e}")));
            }
        }

        if self.running.load(Ordering::SeqCst) {
            self.set_state(StreamState::Streaming);
        }
    }

    /// Spawns a background child at the live offset. `Ok(None)` if the
    /// stream was stopped meanwhile.
    fn open_background(&self, track: &Path, gain: f32) -> Result<Option<ChildStdout>> {
        let mut child = self.orchestrator.spawn_background(
            track,
            self.clock.current_offset(),
            gain,
            None,
            OutputFormat::Pcm,
            self.settings.realtime,
        )?;
        let stdout = child
            .take_stdout()
            .ok_or_else(|| BgmixError::Other("background source has no output".to_string()))?;

        let mut slot = lock(&self.background);
        // Checked under the lock so `stop` either sees this child or we see `stop`
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        *slot = Some(child);
        Ok(Some(stdout))
    }

    fn kill_background(&self) {
        let child = lock(&self.background).take();
        if let Some(mut child) = child {
            child.terminate();
        }
    }

    /// Waits before the next retry. Returns speech that arrived meanwhile.
    fn pause(&self, shutdown: &Receiver<()>, backoff: &mut Duration) -> Option<String> {
        let timeout = *backoff;
        *backoff = (*backoff * 2).min(RETRY_MAX);
        select! {
            recv(self.speech_rx) -> text => text.ok(),
            recv(shutdown) -> _ => None,
            default(timeout) => None,
        }
    }

    fn broadcast(&self, chunk: Vec<u8>) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| match tx.try_send(chunk.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn set_state(&self, to: StreamState) {
        let mut state = lock(&self.state);
        if *state == to {
            return;
        }
        let from = std::mem::replace(&mut *state, to);
        drop(state);
        self.events.emit(EngineEvent::StateChanged { from, to });
    }

    fn track(&self) -> Result<PathBuf> {
        let track = self
            .settings
            .track
            .clone()
            .ok_or(BgmixError::NoBackgroundTrack)?;
        if !track.is_file() {
            return Err(BgmixError::BackgroundTrackNotFound {
                path: track.display().to_string(),
            });
        }
        Ok(track)
    }
}

/// Reads up to `size` bytes, stopping early only at end of output.
fn read_chunk(reader: &mut impl Read, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size.max(1)];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
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
    use crate::audio::format::AudioSpec;
    use crate::audio::wav;
    use crate::mixer::MixerSettings;
    use crate::synth::MockSynthesizer;
    use std::time::Instant;

    struct Fixture {
        service: ContinuousStreamService,
        events: Receiver<EngineEvent>,
        _track: tempfile::NamedTempFile,
    }

    /// A service whose mixing engine is missing: background retries, speech
    /// falls back to speech only.
    fn fixture(speech_queue: usize) -> Fixture {
        fixture_with_track(speech_queue, None)
    }

    fn fixture_with_track(speech_queue: usize, track_override: Option<PathBuf>) -> Fixture {
        let track = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(track.path(), wav::silence_wav(AudioSpec::default(), 100).unwrap()).unwrap();
        let track_path = track_override.unwrap_or_else(|| track.path().to_path_buf());
        let (events, rx) = EventSender::channel(1024);
        let synth = MockSynthesizer::with_silence(AudioSpec::default(), 200).unwrap();
        let orchestrator = MixOrchestrator::new(
            MixerSettings {
                program: "/nonexistent/bgmix-mixer".to_string(),
                ..MixerSettings::default()
            },
            Arc::new(synth),
            events.clone(),
        );
        let clock = Arc::new(
            PlaybackClock::with_clock(159.0, Arc::new(ManualClock::new())).unwrap(),
        );
        let service = ContinuousStreamService::new(
            StreamSettings {
                track: Some(track_path),
                speech_queue,
                realtime: false,
                ..StreamSettings::default()
            },
            orchestrator,
            clock,
            DuckingController::new(0.35, 0.15, events.clone()),
            None,
            events,
        );
        Fixture {
            service,
            events: rx,
            _track: track,
        }
    }

    #[test]
    fn test_start_requires_existing_track() {
        let fx = fixture_with_track(4, Some(PathBuf::from("/nonexistent/game.wav")));
        let err = fx.service.start().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(fx.service.state(), StreamState::Idle);
        assert!(!fx.service.is_running());
    }

    #[test]
    fn test_start_is_idempotent_and_stop_is_terminal() {
        let fx = fixture(4);
        assert!(fx.service.start().unwrap());
        assert!(!fx.service.start().unwrap());
        assert_eq!(fx.service.state(), StreamState::Streaming);

        fx.service.stop();
        fx.service.stop();
        assert_eq!(fx.service.state(), StreamState::Stopped);
        assert!(!fx.service.is_running());
        assert!(matches!(fx.service.start(), Err(BgmixError::StreamStopped)));
        assert!(!fx.service.enqueue_speech("too late"));
    }

    #[test]
    fn test_speech_reaches_subscribers_without_mixer() {
        let fx = fixture(4);
        let rx = fx.service.subscribe();
        fx.service.start().unwrap();
        assert!(fx.service.enqueue_speech("hello"));

        // 200 ms of 8 kHz mono s16le, header stripped
        let chunk = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(chunk.len(), 3200);

        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.service.state() != StreamState::Streaming && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        fx.service.stop();

        let events: Vec<EngineEvent> = fx.events.try_iter().collect();
        assert!(events.contains(&EngineEvent::StateChanged {
            from: StreamState::Streaming,
            to: StreamState::Mixing,
        }));
        assert!(events.contains(&EngineEvent::StateChanged {
            from: StreamState::Mixing,
            to: StreamState::Streaming,
        }));
    }

    #[test]
    fn test_full_queue_drops_speech() {
        let fx = fixture(1);
        assert!(fx.service.enqueue_speech("first"));
        assert!(!fx.service.enqueue_speech("second"));
        assert!(!fx.service.enqueue_speech("   "));
        assert_eq!(fx.service.pending(), 1);

        let dropped: Vec<String> = fx
            .events
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::SpeechDropped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, vec!["speech queue full", "empty text"]);
    }

    #[test]
    fn test_disconnected_subscribers_are_pruned() {
        let fx = fixture(4);
        let kept = fx.service.subscribe();
        drop(fx.service.subscribe());
        assert_eq!(fx.service.subscriber_count(), 2);

        fx.service.shared.broadcast(vec![1, 2, 3]);
        assert_eq!(fx.service.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_slow_subscriber_misses_chunks() {
        let fx = fixture(4);
        let rx = fx.service.subscribe();
        for i in 0..(defaults::SUBSCRIBER_BUFFER + 10) {
            fx.service.shared.broadcast(vec![i as u8]);
        }
        assert_eq!(rx.len(), defaults::SUBSCRIBER_BUFFER);
        assert_eq!(fx.service.subscriber_count(), 1);
    }

    #[test]
    fn test_status_reports_live_values() {
        let fx = fixture(4);
        fx.service.enqueue_speech("queued");
        let status = fx.service.status();
        assert!(!status.running);
        assert_eq!(status.state, StreamState::Idle);
        assert_eq!(status.pending, 1);
        assert_eq!(status.track_duration_secs, 159.0);
        assert!((status.gain - 0.35).abs() < 1e-6);
    }
}
