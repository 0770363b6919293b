//! Chunked reader over a running mix pipeline.

use crate::audio::format::{AudioSpec, OutputFormat};
use crate::audio::wav::{self, HeaderStripper};
use crate::classify::{ChunkOrigin, ClassifierTap};
use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, FallbackKind};
use crate::mixer::orchestrator::FallbackPlan;
use crate::process::{KillSwitch, SupervisedChild, describe_status};
use crate::synth::SpeechStream;
use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

/// How long an engine may take to exit after its output reached EOF.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Speech passed through untouched, or with its WAV header removed.
pub(crate) enum SpeechReader {
    Container(SpeechStream),
    Pcm(HeaderStripper<SpeechStream>),
}

impl SpeechReader {
    fn header(&self) -> Option<&wav::WavHeader> {
        match self {
            SpeechReader::Container(_) => None,
            SpeechReader::Pcm(stripper) => stripper.header(),
        }
    }

    fn stream(&self) -> &SpeechStream {
        match self {
            SpeechReader::Container(stream) => stream,
            SpeechReader::Pcm(stripper) => stripper.get_ref(),
        }
    }

    fn stream_mut(&mut self) -> &mut SpeechStream {
        match self {
            SpeechReader::Container(stream) => stream,
            SpeechReader::Pcm(stripper) => stripper.get_mut(),
        }
    }
}

impl Read for SpeechReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SpeechReader::Container(stream) => stream.read(buf),
            SpeechReader::Pcm(stripper) => stripper.read(buf),
        }
    }
}

/// Where the bytes of a [`MixStream`] currently come from.
pub(crate) enum Source {
    /// Speech engine piped into the mixer.
    Mixed {
        mixer: SupervisedChild,
        synth: Option<SupervisedChild>,
    },
    /// Speech alone.
    Speech(SpeechReader),
    /// Background alone.
    Background(SupervisedChild),
    /// Background alone, header removed, continuing a stream that already
    /// carried one.
    Resumed(HeaderStripper<SupervisedChild>),
    /// In-memory silent clip.
    Silence(Cursor<Vec<u8>>),
    Done,
}

impl Source {
    pub(crate) fn speech(stream: SpeechStream, format: OutputFormat) -> Self {
        match format {
            OutputFormat::Pcm => Source::Speech(SpeechReader::Pcm(HeaderStripper::new(stream))),
            OutputFormat::Wav | OutputFormat::Mp3 => Source::Speech(SpeechReader::Container(stream)),
        }
    }

    pub(crate) fn silence(spec: AudioSpec, millis: u32, format: OutputFormat) -> Self {
        let clip = match wav::silence_wav(spec, millis) {
            Ok(clip) => clip,
            Err(_) => return Source::Done,
        };
        let bytes = match format {
            OutputFormat::Pcm => clip[wav::MIN_HEADER_LEN.min(clip.len())..].to_vec(),
            OutputFormat::Wav | OutputFormat::Mp3 => clip,
        };
        Source::Silence(Cursor::new(bytes))
    }

    fn origin(&self) -> ChunkOrigin {
        match self {
            Source::Mixed { .. } => ChunkOrigin::Mix,
            Source::Background(_) | Source::Resumed(_) => ChunkOrigin::Background,
            Source::Speech(_) | Source::Silence(_) | Source::Done => ChunkOrigin::Speech,
        }
    }

    /// Container of the bytes this source yields when `requested` was asked
    /// for. Speech and silence are WAV unless stripped to raw PCM.
    fn container(&self, requested: OutputFormat) -> OutputFormat {
        match (self, requested) {
            (Source::Speech(SpeechReader::Container(_)) | Source::Silence(_), OutputFormat::Mp3) => {
                OutputFormat::Wav
            }
            _ => requested,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Mixed { mixer, .. } => mixer.read(buf),
            Source::Speech(reader) => reader.read(buf),
            Source::Background(child) => child.read(buf),
            Source::Resumed(stripper) => stripper.read(buf),
            Source::Silence(cursor) => cursor.read(buf),
            Source::Done => Ok(0),
        }
    }

    fn attach(&mut self, switch: &KillSwitch) {
        match self {
            Source::Mixed { mixer, synth } => {
                mixer.attach(switch);
                if let Some(synth) = synth {
                    synth.attach(switch);
                }
            }
            Source::Speech(reader) => {
                if let Some(child) = reader.stream_mut().child_mut() {
                    child.attach(switch);
                }
            }
            Source::Background(child) => child.attach(switch),
            Source::Resumed(stripper) => stripper.get_mut().attach(switch),
            Source::Silence(_) | Source::Done => {}
        }
    }

    fn pids(&self) -> Vec<u32> {
        match self {
            Source::Mixed { mixer, synth } => {
                let mut pids = vec![mixer.pid()];
                pids.extend(synth.as_ref().map(SupervisedChild::pid));
                pids
            }
            Source::Speech(reader) => reader
                .stream()
                .child()
                .map(SupervisedChild::pid)
                .into_iter()
                .collect(),
            Source::Background(child) => vec![child.pid()],
            Source::Resumed(stripper) => vec![stripper.get_ref().pid()],
            Source::Silence(_) | Source::Done => Vec::new(),
        }
    }
}

/// Ordered, fixed-size chunks of mixed audio.
///
/// Owns every child process of its pipeline. Reading to the end, calling
/// [`MixStream::cancel`], or dropping the stream terminates and reaps them.
pub struct MixStream {
    plan: FallbackPlan,
    source: Source,
    /// Container of the bytes handed out; fixed once output has started.
    format: OutputFormat,
    chunk_size: usize,
    /// Bytes read from sources so far; a source that ends at zero falls back.
    produced: u64,
    chunks: u64,
    tap: Option<ClassifierTap>,
    kill_switch: Option<KillSwitch>,
    speech_spec_checked: bool,
    /// First chunk, read early by [`MixStream::resolved_format`].
    lookahead: Option<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
}

impl MixStream {
    pub(crate) fn new(plan: FallbackPlan, source: Source) -> Self {
        let chunk_size = plan.inner.settings.chunk_size.max(1);
        let format = source.container(plan.format);
        Self {
            plan,
            source,
            format,
            chunk_size,
            produced: 0,
            chunks: 0,
            tap: None,
            kill_switch: None,
            speech_spec_checked: false,
            lookahead: None,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        }
    }

    /// Forwards a copy of every chunk to the classifier.
    pub fn with_tap(mut self, tap: Option<ClassifierTap>) -> Self {
        self.tap = tap;
        self
    }

    /// Lets `switch` kill every child this stream runs, including degraded
    /// sources started later. Once it trips the stream ends.
    pub fn with_kill_switch(mut self, switch: KillSwitch) -> Self {
        self.source.attach(&switch);
        self.kill_switch = Some(switch);
        self
    }

    /// Background offset the pipeline was started at.
    pub fn offset_secs(&self) -> f64 {
        self.plan.offset_secs
    }

    /// Container of the bytes handed out so far. Differs from the requested
    /// format when an mp3 request fell back to WAV speech or silence.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Container of the bytes this stream hands out.
    ///
    /// Reads ahead to the first chunk, so a fallback taken before any output
    /// (a mixer that started but wrote nothing) is already reflected.
    pub fn resolved_format(&mut self) -> Result<OutputFormat> {
        if self.chunks == 0 && !self.finished {
            self.lookahead = self.read_chunk()?;
        }
        Ok(self.format)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total bytes read from the pipeline so far.
    pub fn bytes_emitted(&self) -> u64 {
        self.produced
    }

    /// PIDs of the child processes currently owned by this stream.
    pub fn process_ids(&self) -> Vec<u32> {
        self.source.pids()
    }

    /// Next chunk, `None` once the pipeline is exhausted.
    ///
    /// Every chunk but the last is exactly `chunk_size` bytes.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(chunk) = self.lookahead.take() {
            return Ok(Some(chunk));
        }
        self.read_chunk()
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        let mut origin = self.source.origin();
        while filled < self.chunk_size {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => {
                    if !self.advance() {
                        break;
                    }
                    origin = self.source.origin();
                }
                Ok(n) => {
                    filled += n;
                    self.produced += n as u64;
                    self.check_speech_spec();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.plan
                        .inner
                        .events
                        .emit(EngineEvent::warning(format!("read from pipeline failed: {e}")));
                    if !self.advance() {
                        break;
                    }
                }
            }
        }

        if filled == 0 {
            self.finished = true;
            self.plan.inner.events.emit(EngineEvent::MixFinished {
                bytes: self.produced,
                chunks: self.chunks,
            });
            return Ok(None);
        }

        buf.truncate(filled);
        self.chunks += 1;
        if let Some(tap) = &self.tap {
            tap.offer(&buf, origin, self.format != OutputFormat::Mp3);
        }
        Ok(Some(buf))
    }

    /// Copies the whole stream into `out`, chunk by chunk.
    ///
    /// A writer that goes away (broken pipe, reset socket) tears the
    /// pipeline down immediately and yields [`BgmixError::ConsumerDisconnected`].
    pub fn pump_to<W: Write>(&mut self, out: &mut W) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk()? {
            if let Err(e) = out.write_all(&chunk).and_then(|()| out.flush()) {
                self.cancel();
                return Err(match e.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof => {
                        self.plan.inner.events.emit(EngineEvent::ConsumerDisconnected);
                        BgmixError::ConsumerDisconnected
                    }
                    _ => BgmixError::Io(e),
                });
            }
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Stops the pipeline now: kills and reaps every child.
    pub fn cancel(&mut self) {
        terminate(&mut self.source);
        self.source = Source::Done;
        self.lookahead = None;
        self.finished = true;
    }

    /// Warns once when speech stripped to raw PCM is not in the stream's
    /// layout; those samples would play at the wrong speed.
    fn check_speech_spec(&mut self) {
        if self.speech_spec_checked {
            return;
        }
        let Source::Speech(reader) = &self.source else {
            return;
        };
        let Some(spec) = reader.header().map(|header| header.spec) else {
            return;
        };
        self.speech_spec_checked = true;
        let expected = self.plan.inner.settings.spec;
        if spec != expected {
            self.plan.inner.events.emit(EngineEvent::warning(format!(
                "speech is {spec} but the stream is {expected}; spliced as is"
            )));
        }
    }

    /// Called when the current source hits EOF. Reaps it and installs the
    /// next degraded source: the next fallback when nothing was produced
    /// yet, music alone when the mixer crashed mid-stream.
    /// Returns false when the stream is over.
    fn advance(&mut self) -> bool {
        if self.kill_switch.as_ref().is_some_and(KillSwitch::is_tripped) {
            terminate(&mut self.source);
            self.source = Source::Done;
            return false;
        }
        let source = std::mem::replace(&mut self.source, Source::Done);
        let produced_any = self.produced > 0;
        let program = self.plan.inner.settings.program.clone();
        let events = self.plan.inner.events.clone();

        let next = match source {
            Source::Mixed { mut mixer, synth } => {
                let status = mixer.finish(EXIT_GRACE);
                if let Some(mut synth) = synth {
                    synth.finish(EXIT_GRACE).ok();
                }
                let failure = exit_failure(status);
                match (produced_any, failure) {
                    (true, Some(status)) => {
                        events.emit(EngineEvent::EngineCrashed {
                            engine: program,
                            status,
                        });
                        // Speech already went out; only music may follow
                        self.plan.continuation_source()
                    }
                    (true, None) => None,
                    (false, failure) => {
                        events.emit(EngineEvent::Fallback {
                            kind: FallbackKind::SpeechOnly,
                            reason: match failure {
                                Some(status) => format!("mixer exited with {status} before producing audio"),
                                None => "mixer produced no audio".to_string(),
                            },
                        });
                        Some(self.plan.speech_source())
                    }
                }
            }
            Source::Speech(mut reader) => {
                let stream = reader.stream_mut();
                let engine = stream.source().to_string();
                let failure = stream
                    .child_mut()
                    .and_then(|child| exit_failure(child.finish(EXIT_GRACE)));
                match (produced_any, failure) {
                    (true, Some(status)) => {
                        events.emit(EngineEvent::EngineCrashed { engine, status });
                        None
                    }
                    (true, None) => None,
                    (false, _) => {
                        events.emit(EngineEvent::Fallback {
                            kind: FallbackKind::BackgroundOnly,
                            reason: format!("{engine} produced no audio"),
                        });
                        Some(self.plan.background_source())
                    }
                }
            }
            Source::Background(mut child) => self.background_ended(&mut child, produced_any, program),
            Source::Resumed(mut stripper) => {
                self.background_ended(stripper.get_mut(), produced_any, program)
            }
            Source::Silence(_) | Source::Done => None,
        };

        match next {
            Some(mut source) => {
                if let Some(switch) = &self.kill_switch {
                    source.attach(switch);
                }
                if !produced_any {
                    self.format = source.container(self.plan.format);
                }
                self.source = source;
                true
            }
            None => false,
        }
    }

    fn background_ended(
        &self,
        child: &mut SupervisedChild,
        produced_any: bool,
        program: String,
    ) -> Option<Source> {
        let failure = exit_failure(child.finish(EXIT_GRACE));
        match (produced_any, failure) {
            (true, Some(status)) => {
                self.plan.inner.events.emit(EngineEvent::EngineCrashed {
                    engine: program,
                    status,
                });
                None
            }
            (true, None) => None,
            (false, _) => Some(self.plan.silence_source()),
        }
    }
}

/// `Some(description)` when the child failed or could not be reaped.
fn exit_failure(status: Result<std::process::ExitStatus>) -> Option<String> {
    match status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(describe_status(&status)),
        Err(e) => Some(e.to_string()),
    }
}

fn terminate(source: &mut Source) {
    match source {
        Source::Mixed { mixer, synth } => {
            mixer.terminate();
            if let Some(synth) = synth {
                synth.terminate();
            }
        }
        Source::Speech(reader) => {
            if let Some(child) = reader.stream_mut().child_mut() {
                child.terminate();
            }
        }
        Source::Background(child) => child.terminate(),
        Source::Resumed(stripper) => stripper.get_mut().terminate(),
        Source::Silence(_) | Source::Done => {}
    }
}

impl Read for MixStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pending_pos >= self.pending.len() {
            match self.next_chunk() {
                Ok(Some(chunk)) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                Ok(None) => return Ok(0),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        let n = out.len().min(self.pending.len() - self.pending_pos);
        out[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }
}

impl Iterator for MixStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

impl Drop for MixStream {
    fn drop(&mut self) {
        terminate(&mut self.source);
    }
}

impl std::fmt::Debug for MixStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixStream")
            .field("offset_secs", &self.plan.offset_secs)
            .field("format", &self.format)
            .field("chunk_size", &self.chunk_size)
            .field("produced", &self.produced)
            .field("finished", &self.finished)
            .finish()
    }
}
