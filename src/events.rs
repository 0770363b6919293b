//! Structured engine events and the logger thread that renders them.
//!
//! Components never print directly. They emit [`EngineEvent`]s into a
//! bounded channel through an [`EventSender`]; a dedicated thread drains the
//! channel and renders to stderr. Emitting never blocks: a full or absent
//! channel drops the event.

use crate::classify::AudioType;
use crate::mixer::filter::MixMode;
use crate::stream::StreamState;
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};

/// Which half of a mix survived a degraded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// Music only, speech could not be produced.
    BackgroundOnly,
    /// Speech only, the mixer could not run or the track is missing.
    SpeechOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ServiceStarted {
        track: Option<String>,
        track_duration_secs: f64,
    },
    ServiceStopped,
    StateChanged {
        from: StreamState,
        to: StreamState,
    },
    SpeechQueued {
        text: String,
        pending: usize,
    },
    SpeechDropped {
        text: String,
        reason: String,
    },
    MixStarted {
        offset_secs: f64,
        background_gain: f32,
        foreground_gain: f32,
        mode: MixMode,
    },
    MixFinished {
        bytes: u64,
        chunks: u64,
    },
    BackgroundOpened {
        offset_secs: f64,
        gain: f32,
    },
    EngineSelected {
        engine: String,
    },
    EngineUnavailable {
        engine: String,
    },
    SilenceFallback {
        millis: u32,
    },
    Fallback {
        kind: FallbackKind,
        reason: String,
    },
    EngineCrashed {
        engine: String,
        status: String,
    },
    ConsumerDisconnected,
    VolumeDucked {
        level: f32,
        restore_after_secs: f64,
    },
    VolumeRestored {
        level: f32,
    },
    AudioDetected {
        audio_type: AudioType,
        elapsed_secs: f64,
    },
    Warning {
        message: String,
    },
}

/// How loud an event is, compared against the logger's verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Warning = 0,
    Info = 1,
    Debug = 2,
}

impl EngineEvent {
    pub fn level(&self) -> EventLevel {
        match self {
            EngineEvent::Fallback { .. }
            | EngineEvent::EngineCrashed { .. }
            | EngineEvent::SpeechDropped { .. }
            | EngineEvent::SilenceFallback { .. }
            | EngineEvent::Warning { .. } => EventLevel::Warning,
            EngineEvent::ServiceStarted { .. }
            | EngineEvent::ServiceStopped
            | EngineEvent::StateChanged { .. }
            | EngineEvent::SpeechQueued { .. }
            | EngineEvent::VolumeDucked { .. }
            | EngineEvent::VolumeRestored { .. }
            | EngineEvent::EngineUnavailable { .. } => EventLevel::Info,
            EngineEvent::MixStarted { .. }
            | EngineEvent::MixFinished { .. }
            | EngineEvent::BackgroundOpened { .. }
            | EngineEvent::EngineSelected { .. }
            | EngineEvent::ConsumerDisconnected
            | EngineEvent::AudioDetected { .. } => EventLevel::Debug,
        }
    }

    pub(crate) fn warning(message: impl Into<String>) -> Self {
        EngineEvent::Warning {
            message: message.into(),
        }
    }
}

/// Cloneable, non-blocking handle for emitting events.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<Sender<EngineEvent>>,
}

impl EventSender {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Creates a bounded event channel.
    pub fn channel(capacity: usize) -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Emits an event, dropping it when the channel is full or closed.
    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // Full or disconnected: the event is dropped
            tx.try_send(event).ok();
        }
    }
}

/// Spawns the logger thread. It exits once every sender is dropped.
pub fn spawn_logger(rx: Receiver<EngineEvent>, verbosity: u8) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            if (event.level() as u8) <= verbosity {
                crate::output::render_event(&event);
            }
        }
    })
}
