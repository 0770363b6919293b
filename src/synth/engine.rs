//! Engine chain: try each configured TTS program in priority order.

use crate::audio::format::AudioSpec;
use crate::defaults;
use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, EventSender};
use crate::process::{CommandLine, PipeInput, SupervisedChild};
use crate::synth::{SpeechStream, SpeechSynthesizer};
use serde::{Deserialize, Serialize};

/// One text-to-speech program and its argument template.
///
/// Arguments may contain `{text}`, `{rate}`, `{amplitude}` and `{voice}`.
/// The engine must write a complete audio container to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EngineSpec {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// espeak: richer primary engine.
    pub fn espeak() -> Self {
        Self::new(
            "espeak",
            "espeak",
            &[
                "-s", "{rate}", "-a", "{amplitude}", "-v", "{voice}", "--stdout", "{text}",
            ],
        )
    }

    /// flite: lightweight fallback.
    pub fn flite() -> Self {
        Self::new("flite", "flite", &["-t", "{text}", "-o", "-"])
    }

    /// Default chain, in priority order.
    pub fn default_chain() -> Vec<Self> {
        vec![Self::espeak(), Self::flite()]
    }

    /// Expands placeholders for one request. The text is always a single
    /// argument; it is never passed through a shell.
    pub fn command_line(&self, text: &str, settings: &SynthSettings) -> CommandLine {
        let rate = settings.rate.to_string();
        let amplitude = settings.amplitude.to_string();
        let args = self.args.iter().map(|arg| {
            if arg == "{text}" {
                text.to_string()
            } else {
                arg.replace("{rate}", &rate)
                    .replace("{amplitude}", &amplitude)
                    .replace("{voice}", &settings.voice)
            }
        });
        CommandLine::new(&self.program).args(args)
    }
}

/// Knobs shared by every engine in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthSettings {
    pub rate: u32,
    pub amplitude: u32,
    pub voice: String,
    /// Length of the silent clip used when no engine is available.
    pub silence_ms: u32,
    /// Layout of the silent clip.
    pub spec: AudioSpec,
    pub engines: Vec<EngineSpec>,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            rate: defaults::SPEECH_RATE,
            amplitude: defaults::SPEECH_AMPLITUDE,
            voice: defaults::SPEECH_VOICE.to_string(),
            silence_ms: defaults::SILENCE_MS,
            spec: AudioSpec::default(),
            engines: EngineSpec::default_chain(),
        }
    }
}

/// Synthesizer backed by external programs.
///
/// Falls through to the next engine only when one cannot be started at all.
/// Once an engine is running it owns the request, even if it later fails,
/// so output from two engines is never interleaved.
pub struct CommandSynthesizer {
    settings: SynthSettings,
    events: EventSender,
}

impl CommandSynthesizer {
    pub fn new(settings: SynthSettings, events: EventSender) -> Self {
        Self { settings, events }
    }

    pub fn settings(&self) -> &SynthSettings {
        &self.settings
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str) -> Result<SpeechStream> {
        for engine in &self.settings.engines {
            let command = engine.command_line(text, &self.settings);
            match SupervisedChild::spawn(&engine.name, &command, PipeInput::Null) {
                Ok(child) => {
                    self.events.emit(EngineEvent::EngineSelected {
                        engine: engine.name.clone(),
                    });
                    return Ok(SpeechStream::Process {
                        engine: engine.name.clone(),
                        child,
                    });
                }
                Err(BgmixError::EngineUnavailable { engine }) => {
                    self.events.emit(EngineEvent::EngineUnavailable { engine });
                }
                Err(e) => return Err(e),
            }
        }

        self.events.emit(EngineEvent::SilenceFallback {
            millis: self.settings.silence_ms,
        });
        SpeechStream::silence(self.settings.spec, self.settings.silence_ms)
    }

    fn name(&self) -> &str {
        "command"
    }
}
