//! Error types for bgmix.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BgmixError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Background track not found at {path}")]
    BackgroundTrackNotFound { path: String },

    #[error("No background track configured (set track.path)")]
    NoBackgroundTrack,

    // Engine errors
    #[error("Engine not available: {engine}")]
    EngineUnavailable { engine: String },

    #[error("Engine {engine} exited with {status}")]
    EngineCrashed { engine: String, status: String },

    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    // Stream errors
    #[error("Consumer disconnected")]
    ConsumerDisconnected,

    #[error("Continuous stream already stopped")]
    StreamStopped,

    #[error("WAV error: {message}")]
    Wav { message: String },

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    #[error("IPC connection failed: {message}")]
    IpcConnection { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl BgmixError {
    /// Errors that degrade a single request but never stop the service.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BgmixError::EngineUnavailable { .. }
                | BgmixError::EngineCrashed { .. }
                | BgmixError::ConsumerDisconnected
        )
    }

    /// Configuration errors are surfaced to the caller immediately.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BgmixError::ConfigFileNotFound { .. }
                | BgmixError::ConfigParse { .. }
                | BgmixError::ConfigInvalidValue { .. }
                | BgmixError::Config(_)
                | BgmixError::BackgroundTrackNotFound { .. }
                | BgmixError::NoBackgroundTrack
        )
    }

    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        BgmixError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl From<hound::Error> for BgmixError {
    fn from(e: hound::Error) -> Self {
        BgmixError::Wav {
            message: e.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, BgmixError>;
