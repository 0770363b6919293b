//! Audio classifier: labels emitted chunks and keeps a transcript.
//!
//! Producers hand chunks over through a [`ClassifierTap`], which never
//! blocks: when the classifier falls behind, chunks are dropped. The audio
//! path does not depend on this module keeping up.

pub mod station;
pub mod transcript;

pub use station::{ErrorReporter, EventReporter, Station, StationError, StationRunner};
pub use transcript::{Summary, Transcript, TranscriptEntry};

use crate::audio::clock::Clock;
use crate::audio::wav;
use crate::defaults;
use crate::events::{EngineEvent, EventSender};
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// What a chunk sounds like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioType {
    Music,
    Speech,
    Mixed,
    Silence,
}

impl AudioType {
    pub const ALL: [AudioType; 4] = [
        AudioType::Music,
        AudioType::Speech,
        AudioType::Mixed,
        AudioType::Silence,
    ];
}

impl fmt::Display for AudioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            AudioType::Music => "music",
            AudioType::Speech => "speech",
            AudioType::Mixed => "mixed",
            AudioType::Silence => "silence",
        })
    }
}

/// Which part of the pipeline produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrigin {
    Background,
    Speech,
    Mix,
}

/// A copy of one emitted chunk.
#[derive(Debug, Clone)]
pub struct TapChunk {
    pub data: Vec<u8>,
    pub origin: ChunkOrigin,
    /// False when the bytes are compressed and cannot be read as samples.
    pub pcm: bool,
    /// What was being spoken, when known.
    pub text: Option<Arc<str>>,
}

/// Non-blocking feed into the classifier.
#[derive(Debug, Clone)]
pub struct ClassifierTap {
    tx: Sender<TapChunk>,
    text: Option<Arc<str>>,
}

impl ClassifierTap {
    pub fn channel(capacity: usize) -> (Self, Receiver<TapChunk>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx, text: None }, rx)
    }

    /// The same tap, labelling chunks with the text being spoken.
    pub fn with_text(&self, text: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            text: Some(Arc::from(text)),
        }
    }

    /// Offers a copy of `data`. Dropped if the queue is full.
    pub fn offer(&self, data: &[u8], origin: ChunkOrigin, pcm: bool) {
        if self.tx.is_full() {
            return;
        }
        self.tx
            .try_send(TapChunk {
                data: data.to_vec(),
                origin,
                pcm,
                text: self.text.clone(),
            })
            .ok();
    }
}

/// Normalized RMS of 16-bit little-endian PCM, in `[0, 1]`.
pub fn calculate_rms(bytes: &[u8]) -> f32 {
    let samples = wav::pcm_samples(bytes);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Number of envelope windows per chunk.
const ENVELOPE_WINDOWS: usize = 16;

/// Envelope variation above which unlabelled audio counts as speech.
const SPEECH_MODULATION: f32 = 0.5;

/// Heuristic classifier. Accuracy is best-effort; only silence detection is
/// reliable.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    pub silence_threshold: f32,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            silence_threshold: defaults::SILENCE_THRESHOLD,
        }
    }
}

impl Classifier {
    pub fn new(silence_threshold: f32) -> Self {
        Self { silence_threshold }
    }

    /// Classifies a raw PCM chunk with no knowledge of where it came from.
    ///
    /// Speech is bursty, music is steady: the decision is made on how much
    /// the short-term loudness varies across the chunk.
    pub fn classify(&self, chunk: &[u8]) -> AudioType {
        if calculate_rms(chunk) < self.silence_threshold {
            return AudioType::Silence;
        }
        if envelope_variation(chunk) > SPEECH_MODULATION {
            AudioType::Speech
        } else {
            AudioType::Music
        }
    }

    /// Classifies a tapped chunk, trusting its origin for anything audible.
    pub fn classify_tapped(&self, chunk: &TapChunk) -> AudioType {
        if chunk.pcm && calculate_rms(&chunk.data) < self.silence_threshold {
            return AudioType::Silence;
        }
        match chunk.origin {
            ChunkOrigin::Background => AudioType::Music,
            ChunkOrigin::Speech => AudioType::Speech,
            ChunkOrigin::Mix => AudioType::Mixed,
        }
    }
}

/// Coefficient of variation of windowed RMS.
fn envelope_variation(chunk: &[u8]) -> f32 {
    let window = (chunk.len() / ENVELOPE_WINDOWS) & !1;
    if window < 2 {
        return 0.0;
    }
    let levels: Vec<f32> = chunk.chunks_exact(window).map(calculate_rms).collect();
    let mean = levels.iter().sum::<f32>() / levels.len() as f32;
    if mean <= f32::EPSILON {
        return 0.0;
    }
    let variance = levels.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / levels.len() as f32;
    variance.sqrt() / mean
}

/// Station that classifies chunks and records a transcript entry whenever
/// the kind of audio (or the spoken text) changes.
pub struct ClassifierStation {
    classifier: Classifier,
    transcript: Arc<Transcript>,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    events: EventSender,
    last: Option<(AudioType, Option<Arc<str>>)>,
}

impl ClassifierStation {
    pub fn new(
        classifier: Classifier,
        transcript: Arc<Transcript>,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Self {
        let started_at = clock.now();
        Self {
            classifier,
            transcript,
            clock,
            started_at,
            events,
            last: None,
        }
    }
}

impl Station for ClassifierStation {
    type Input = TapChunk;
    type Output = TranscriptEntry;

    fn process(&mut self, chunk: TapChunk) -> Result<Option<TranscriptEntry>, StationError> {
        let audio_type = self.classifier.classify_tapped(&chunk);
        let text = match audio_type {
            AudioType::Speech | AudioType::Mixed => chunk.text,
            AudioType::Music | AudioType::Silence => None,
        };
        let current = (audio_type, text);
        if self.last.as_ref() == Some(&current) {
            return Ok(None);
        }

        let elapsed_secs = self
            .clock
            .now()
            .saturating_duration_since(self.started_at)
            .as_secs_f64();
        let description = match (&current.0, &current.1) {
            (_, Some(text)) => text.to_string(),
            (AudioType::Music, None) => "[background music]".to_string(),
            (AudioType::Silence, None) => "[silence]".to_string(),
            (AudioType::Speech, None) => "[speech]".to_string(),
            (AudioType::Mixed, None) => "[speech over music]".to_string(),
        };
        let entry = TranscriptEntry::now(elapsed_secs, audio_type, description);
        self.transcript.record(entry.clone());
        self.events.emit(EngineEvent::AudioDetected {
            audio_type,
            elapsed_secs,
        });
        self.last = Some(current);
        Ok(Some(entry))
    }

    fn name(&self) -> &'static str {
        "classifier"
    }
}

/// Classifier service: a tap for producers, a station thread, a transcript.
pub struct AudioClassifier {
    tap: ClassifierTap,
    transcript: Arc<Transcript>,
    runner: StationRunner<ClassifierStation>,
}

impl AudioClassifier {
    pub fn spawn(
        classifier: Classifier,
        queue: usize,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Self {
        let transcript = Arc::new(Transcript::new());
        let (tap, rx) = ClassifierTap::channel(queue);
        let station = ClassifierStation::new(
            classifier,
            Arc::clone(&transcript),
            clock,
            events.clone(),
        );
        let runner = StationRunner::spawn(station, rx, None, Arc::new(EventReporter::new(events)));
        Self {
            tap,
            transcript,
            runner,
        }
    }

    pub fn tap(&self) -> ClassifierTap {
        self.tap.clone()
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    pub fn summary(&self) -> Summary {
        self.transcript.summary()
    }

    /// Stops the station once every tap handed out has been dropped.
    pub fn shutdown(self) -> Result<(), String> {
        drop(self.tap);
        self.runner.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::ManualClock;
    use std::time::Duration;

    fn pcm(samples: impl IntoIterator<Item = i16>) -> Vec<u8> {
        samples.into_iter().flat_map(i16::to_le_bytes).collect()
    }

    fn tone(len: usize, amplitude: f32) -> Vec<u8> {
        pcm((0..len).map(|i| ((i as f32 * 0.3).sin() * amplitude * 32767.0) as i16))
    }

    fn chunk(data: Vec<u8>, origin: ChunkOrigin, text: Option<&str>) -> TapChunk {
        TapChunk {
            data,
            origin,
            pcm: true,
            text: text.map(Arc::from),
        }
    }

    #[test]
    fn test_rms_of_silence_and_full_scale() {
        assert_eq!(calculate_rms(&pcm([0; 100])), 0.0);
        let full = calculate_rms(&pcm([i16::MAX, i16::MIN].repeat(50)));
        assert!(full > 0.99);
        assert_eq!(calculate_rms(&[]), 0.0);
    }

    #[test]
    fn test_classify_silence() {
        assert_eq!(Classifier::default().classify(&pcm([0; 2048])), AudioType::Silence);
    }

    #[test]
    fn test_classify_steady_tone_as_music() {
        assert_eq!(Classifier::default().classify(&tone(2048, 0.5)), AudioType::Music);
    }

    #[test]
    fn test_classify_bursts_as_speech() {
        // Loud syllables separated by near-silent gaps
        let mut bytes = Vec::new();
        for i in 0..16 {
            let amplitude = if i % 2 == 0 { 0.8 } else { 0.001 };
            bytes.extend(tone(128, amplitude));
        }
        assert_eq!(Classifier::default().classify(&bytes), AudioType::Speech);
    }

    #[test]
    fn test_origin_decides_audible_chunks() {
        let classifier = Classifier::default();
        let loud = tone(512, 0.5);
        assert_eq!(
            classifier.classify_tapped(&chunk(loud.clone(), ChunkOrigin::Mix, None)),
            AudioType::Mixed
        );
        assert_eq!(
            classifier.classify_tapped(&chunk(loud.clone(), ChunkOrigin::Background, None)),
            AudioType::Music
        );
        assert_eq!(
            classifier.classify_tapped(&chunk(pcm([0; 512]), ChunkOrigin::Mix, None)),
            AudioType::Silence
        );
        let mut compressed = chunk(vec![0; 512], ChunkOrigin::Speech, None);
        compressed.pcm = false;
        assert_eq!(classifier.classify_tapped(&compressed), AudioType::Speech);
    }

    #[test]
    fn test_tap_drops_when_full() {
        let (tap, rx) = ClassifierTap::channel(2);
        for _ in 0..10 {
            tap.offer(&[1, 2], ChunkOrigin::Background, true);
        }
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_tap_with_text_labels_chunks() {
        let (tap, rx) = ClassifierTap::channel(2);
        tap.with_text("hello").offer(&[0, 0], ChunkOrigin::Mix, true);
        assert_eq!(rx.try_recv().unwrap().text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_station_records_transitions_only() {
        let clock = ManualClock::new();
        let transcript = Arc::new(Transcript::new());
        let mut station = ClassifierStation::new(
            Classifier::default(),
            Arc::clone(&transcript),
            Arc::new(clock.clone()),
            EventSender::disabled(),
        );
        let music = tone(512, 0.5);

        assert!(station.process(chunk(music.clone(), ChunkOrigin::Background, None)).unwrap().is_some());
        assert!(station.process(chunk(music.clone(), ChunkOrigin::Background, None)).unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        let entry = station
            .process(chunk(music.clone(), ChunkOrigin::Mix, Some("Hello there")))
            .unwrap()
            .unwrap();
        assert_eq!(entry.classified_type, AudioType::Mixed);
        assert_eq!(entry.text, "Hello there");
        assert!((entry.elapsed_secs - 5.0).abs() < 1e-9);

        // New sentence, same type: still a new entry
        assert!(station.process(chunk(music, ChunkOrigin::Mix, Some("Next"))).unwrap().is_some());

        let entries = transcript.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].text, "[background music]");
    }

    #[test]
    fn test_service_classifies_in_background() {
        let classifier = AudioClassifier::spawn(
            Classifier::default(),
            8,
            Arc::new(ManualClock::new()),
            EventSender::disabled(),
        );
        let tap = classifier.tap();
        tap.offer(&tone(512, 0.5), ChunkOrigin::Background, true);
        tap.offer(&pcm([0; 512]), ChunkOrigin::Background, true);
        drop(tap);

        let transcript = Arc::clone(classifier.transcript());
        classifier.shutdown().unwrap();
        let types: Vec<AudioType> = transcript
            .entries()
            .iter()
            .map(|e| e.classified_type)
            .collect();
        assert_eq!(types, vec![AudioType::Music, AudioType::Silence]);
    }

    #[test]
    fn test_audio_type_display_pads() {
        assert_eq!(format!("{:<7}|", AudioType::Music), "music  |");
        assert_eq!(
            serde_json::to_string(&AudioType::Silence).unwrap(),
            "\"silence\""
        );
    }
}
