//! One-shot command entry points.
//!
//! Commands that run an [`AudioEngine`] in this process write their audio to
//! stdout and return once the audio ends or the reader goes away.

use crate::audio::format::OutputFormat;
use crate::cli::MixOptions;
use crate::config::Config;
use crate::engine::AudioEngine;
use crate::error::{BgmixError, Result};
use crate::events::{EventSender, spawn_logger};
use crate::mixer::MixStream;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the logger may take to drain after the last sender is gone.
const LOGGER_DRAIN: Duration = Duration::from_millis(500);

/// Event channel plus the thread rendering it.
pub struct Logging {
    events: EventSender,
    handle: Option<JoinHandle<()>>,
}

impl Logging {
    /// Starts the logger thread, or discards every event when `quiet`.
    pub fn start(quiet: bool, verbosity: u8) -> Self {
        if quiet {
            return Self {
                events: EventSender::disabled(),
                handle: None,
            };
        }
        let (events, rx) = EventSender::channel(crate::defaults::EVENT_QUEUE);
        Self {
            events,
            handle: Some(spawn_logger(rx, verbosity)),
        }
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Drops this handle's sender and gives the logger a moment to drain.
    ///
    /// Threads that still hold a sender (a pending duck restore) are not
    /// waited for beyond [`LOGGER_DRAIN`].
    pub fn finish(self) {
        let Self { events, handle } = self;
        drop(events);
        if let Some(handle) = handle {
            let deadline = Instant::now() + LOGGER_DRAIN;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                handle.join().ok();
            }
        }
    }
}

/// Fails when stdout is a terminal; audio only goes to pipes.
pub fn ensure_audio_sink() -> Result<()> {
    if std::io::stdout().is_terminal() {
        return Err(BgmixError::Other(
            "Refusing to write audio to a terminal; pipe stdout into a player or another program"
                .to_string(),
        ));
    }
    Ok(())
}

/// Mixes `text` and writes it to stdout.
pub fn run_mix(engine: &AudioEngine, text: &str, options: &MixOptions) -> Result<u64> {
    ensure_audio_sink()?;
    let ducking = engine.config().ducking.enabled && !options.no_ducking;
    let duck_level = options
        .duck_level
        .unwrap_or(engine.config().ducking.level);
    let stream = engine.mix(text, options.background.as_deref(), ducking, duck_level)?;
    write_stream(stream)
}

/// Writes the background track to stdout from the live offset.
pub fn run_background(engine: &AudioEngine, seconds: Option<f64>) -> Result<u64> {
    ensure_audio_sink()?;
    write_stream(engine.background_stream(seconds)?)
}

/// Runs the continuous stream in this process.
///
/// Raw PCM goes to stdout, every non-empty stdin line is queued as speech.
/// Ends when stdout is closed.
pub fn run_stream(engine: Arc<AudioEngine>) -> Result<u64> {
    ensure_audio_sink()?;
    let chunks = engine.subscribe();
    engine.start()?;

    let reader = Arc::clone(&engine);
    std::thread::Builder::new()
        .name("bgmix-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if !line.trim().is_empty() {
                    reader.enqueue_speech(&line);
                }
            }
        })?;

    let mut out = std::io::stdout().lock();
    let mut written = 0u64;
    for chunk in chunks.iter() {
        if out.write_all(&chunk).and_then(|()| out.flush()).is_err() {
            break;
        }
        written += chunk.len() as u64;
    }
    engine.stop();
    Ok(written)
}

/// Copies a mix stream to stdout. A closed stdout ends the copy quietly.
fn write_stream(mut stream: MixStream) -> Result<u64> {
    let mut out = std::io::stdout().lock();
    match stream.pump_to(&mut out) {
        Ok(written) => Ok(written),
        Err(BgmixError::ConsumerDisconnected) => Ok(stream.bytes_emitted()),
        Err(e) => Err(e),
    }
}

/// Applies the one-shot overrides from the command line.
pub fn with_format(mut config: Config, format: Option<OutputFormat>) -> Config {
    if let Some(format) = format {
        config.output.format = format;
    }
    config
}
