//! JSON message protocol for IPC communication between CLI and daemon.
//!
//! Every request is one JSON line. Every reply starts with one JSON line;
//! an [`Response::Audio`] header is followed by raw audio bytes until the
//! daemon closes the connection.

use crate::audio::format::OutputFormat;
use crate::classify::{Summary, TranscriptEntry};
use crate::defaults;
use crate::stream::StreamStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_ducking() -> bool {
    true
}

fn default_duck_level() -> f32 {
    defaults::DUCK_LEVEL
}

/// Commands sent by CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Mix speech over the background at the live offset; replies with audio
    Mix {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<PathBuf>,
        #[serde(default = "default_ducking")]
        ducking: bool,
        #[serde(default = "default_duck_level")]
        duck_level: f32,
    },
    /// Plain background from the live offset; replies with audio
    Background {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
    /// Queue speech for the continuous stream
    Speak { text: String },
    /// Current background offset
    Offset,
    /// Start the continuous stream
    Start,
    /// Stop the continuous stream
    Stop,
    /// Get daemon status
    Status,
    /// Duck the continuous stream for a while
    Duck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
    /// Receive the continuous stream; replies with audio
    Listen,
    /// Classifier transcript and summary
    Transcript,
    /// Shutdown the daemon
    Shutdown,
}

impl Command {
    /// Serialize command to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize command from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn mix(text: impl Into<String>) -> Self {
        Command::Mix {
            text: text.into(),
            background: None,
            ducking: true,
            duck_level: defaults::DUCK_LEVEL,
        }
    }
}

/// Responses sent by daemon to CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Command succeeded
    Ok,
    /// Speech accepted (or dropped) for the continuous stream
    Queued { accepted: bool, pending: usize },
    Offset {
        offset_secs: f64,
        track_duration_secs: f64,
    },
    /// Continuous stream started; false when it already was running
    Started { started: bool },
    Status { status: StreamStatus },
    Ducked { level: f32, restore_after_secs: f64 },
    Transcript {
        entries: Vec<TranscriptEntry>,
        summary: Summary,
    },
    /// Raw audio follows this line
    Audio {
        format: OutputFormat,
        sample_rate: u32,
        channels: u16,
    },
    /// Error occurred
    Error { message: String },
}

impl Response {
    /// Serialize response to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize response from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;

    #[test]
    fn test_command_all_variants_roundtrip() {
        let commands = vec![
            Command::mix("hello"),
            Command::Mix {
                text: "over music".to_string(),
                background: Some(PathBuf::from("/music/game.wav")),
                ducking: false,
                duck_level: 0.3,
            },
            Command::Background { seconds: Some(5.0) },
            Command::Speak {
                text: "goal".to_string(),
            },
            Command::Offset,
            Command::Start,
            Command::Stop,
            Command::Status,
            Command::Duck { seconds: None },
            Command::Listen,
            Command::Transcript,
            Command::Shutdown,
        ];

        for cmd in commands {
            let json = cmd.to_json().expect("should serialize");
            let deserialized = Command::from_json(&json).expect("should deserialize");
            assert_eq!(cmd, deserialized, "roundtrip failed for {:?}", cmd);
        }
    }

    #[test]
    fn test_json_format_is_snake_case() {
        let json = Command::Listen.to_json().unwrap();
        assert_eq!(json, r#"{"type":"listen"}"#);
        let json = Command::Speak { text: "hi".into() }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"speak","text":"hi"}"#);
    }

    #[test]
    fn test_mix_defaults_to_ducking() {
        let cmd = Command::from_json(r#"{"type":"mix","text":"hi"}"#).unwrap();
        assert_eq!(cmd, Command::mix("hi"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Command::from_json(r#"{"type":"toggle"}"#).is_err());
        assert!(Command::from_json("not json").is_err());
    }

    #[test]
    fn test_audio_header_json() {
        let resp = Response::Audio {
            format: OutputFormat::Pcm,
            sample_rate: 8000,
            channels: 1,
        };
        let json = resp.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"audio","format":"pcm","sample_rate":8000,"channels":1}"#
        );
        assert_eq!(Response::from_json(&json).unwrap(), resp);
    }

    #[test]
    fn test_status_response_roundtrip() {
        let resp = Response::Status {
            status: StreamStatus {
                running: true,
                state: StreamState::Mixing,
                pending: 2,
                track: Some(PathBuf::from("/music/game.wav")),
                offset_secs: 12.5,
                track_duration_secs: 159.0,
                gain: 0.15,
                subscribers: 1,
            },
        };
        let json = resp.to_json().unwrap();
        assert!(json.contains(r#""state":"mixing""#));
        assert_eq!(Response::from_json(&json).unwrap(), resp);
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error("Not running");
        let json = resp.to_json().unwrap();
        assert_eq!(json, r#"{"type":"error","message":"Not running"}"#);
    }
}
