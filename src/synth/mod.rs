//! Text-to-speech through external engines writing audio to stdout.

pub mod engine;

pub use engine::{CommandSynthesizer, EngineSpec, SynthSettings};

use crate::audio::format::AudioSpec;
use crate::audio::wav;
use crate::error::{BgmixError, Result};
use crate::process::{PipeInput, SupervisedChild};
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Produces speech audio for a piece of text.
///
/// Implementations return a stream rather than a buffer, so audio can flow
/// into the mixer while the engine is still producing it.
pub trait SpeechSynthesizer: Send + Sync {
    /// Starts synthesizing `text`.
    ///
    /// Succeeds with silence when no engine is available at all.
    fn synthesize(&self, text: &str) -> Result<SpeechStream>;

    /// Name for logging.
    fn name(&self) -> &str;
}

impl<T: SpeechSynthesizer> SpeechSynthesizer for Arc<T> {
    fn synthesize(&self, text: &str) -> Result<SpeechStream> {
        (**self).synthesize(text)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Audio coming out of a synthesizer.
pub enum SpeechStream {
    /// A running engine; audio is read from its stdout.
    Process { engine: String, child: SupervisedChild },
    /// Audio already in memory (silence fallback, mocks).
    Buffered { label: String, data: Cursor<Vec<u8>> },
}

impl SpeechStream {
    pub fn buffered(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        SpeechStream::Buffered {
            label: label.into(),
            data: Cursor::new(bytes),
        }
    }

    /// Fixed-length silent WAV clip.
    pub fn silence(spec: AudioSpec, millis: u32) -> Result<Self> {
        Ok(Self::buffered("silence", wav::silence_wav(spec, millis)?))
    }

    /// Engine name, or the buffer label.
    pub fn source(&self) -> &str {
        match self {
            SpeechStream::Process { engine, .. } => engine,
            SpeechStream::Buffered { label, .. } => label,
        }
    }

    /// Splits the stream into something a downstream child can read on
    /// stdin, plus the engine process (if any) that still has to be reaped.
    pub fn into_pipe_input(self) -> (PipeInput, Option<SupervisedChild>) {
        match self {
            SpeechStream::Process { mut child, .. } => match child.take_stdout() {
                Some(stdout) => (PipeInput::Child(stdout), Some(child)),
                None => (PipeInput::Null, Some(child)),
            },
            SpeechStream::Buffered { data, .. } => {
                let position = data.position() as usize;
                let mut bytes = data.into_inner();
                bytes.drain(..position.min(bytes.len()));
                (PipeInput::Bytes(bytes), None)
            }
        }
    }

    /// The engine process behind this stream, if any.
    pub fn child(&self) -> Option<&SupervisedChild> {
        match self {
            SpeechStream::Process { child, .. } => Some(child),
            SpeechStream::Buffered { .. } => None,
        }
    }

    pub fn child_mut(&mut self) -> Option<&mut SupervisedChild> {
        match self {
            SpeechStream::Process { child, .. } => Some(child),
            SpeechStream::Buffered { .. } => None,
        }
    }
}

impl Read for SpeechStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SpeechStream::Process { child, .. } => child.read(buf),
            SpeechStream::Buffered { data, .. } => data.read(buf),
        }
    }
}

impl std::fmt::Debug for SpeechStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeechStream::Process { engine, child } => f
                .debug_struct("Process")
                .field("engine", engine)
                .field("pid", &child.pid())
                .finish(),
            SpeechStream::Buffered { label, data } => f
                .debug_struct("Buffered")
                .field("label", label)
                .field("len", &data.get_ref().len())
                .finish(),
        }
    }
}

/// Mock synthesizer for testing
#[derive(Debug)]
pub struct MockSynthesizer {
    audio: Vec<u8>,
    should_fail: bool,
    calls: AtomicUsize,
}

impl MockSynthesizer {
    /// Returns `audio` for every request.
    pub fn new(audio: Vec<u8>) -> Self {
        Self {
            audio,
            should_fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns `millis` of silence in `spec` for every request.
    pub fn with_silence(spec: AudioSpec, millis: u32) -> Result<Self> {
        Ok(Self::new(wav::silence_wav(spec, millis)?))
    }

    /// Configure the mock to fail on synthesize
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechSynthesizer for MockSynthesizer {
    fn synthesize(&self, _text: &str) -> Result<SpeechStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(BgmixError::Spawn {
                program: "mock".to_string(),
                message: "mock synthesis failure".to_string(),
            });
        }
        Ok(SpeechStream::buffered("mock", self.audio.clone()))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
