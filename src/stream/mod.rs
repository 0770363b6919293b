//! Continuous background stream with speech spliced in on demand.

pub mod service;

pub use service::{ContinuousStreamService, StreamSettings};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of the continuous stream.
///
/// `Idle -> Streaming <-> Mixing`, and `Stopped` from anywhere once
/// [`ContinuousStreamService::stop`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    /// Background only.
    Streaming,
    /// Background plus speech.
    Mixing,
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Mixing => "mixing",
            StreamState::Stopped => "stopped",
        })
    }
}

/// Point-in-time view of the continuous stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub running: bool,
    pub state: StreamState,
    /// Speech requests waiting to be mixed.
    pub pending: usize,
    pub track: Option<PathBuf>,
    pub offset_secs: f64,
    pub track_duration_secs: f64,
    /// Background gain currently applied.
    pub gain: f32,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(StreamState::Mixing.to_string(), "mixing");
        assert_eq!(StreamState::default(), StreamState::Idle);
        assert_eq!(
            serde_json::to_string(&StreamState::Streaming).unwrap(),
            "\"streaming\""
        );
        let state: StreamState = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(state, StreamState::Stopped);
    }
}
