//! Command-line interface for bgmix
//!
//! Provides argument parsing using clap derive macros.

use crate::audio::format::OutputFormat;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Background music mixing and speech ducking
#[derive(Parser, Debug)]
#[command(
    name = "bgmix",
    version,
    about = "Mix synthesized speech over a continuously playing background track"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to daemon socket (default: $XDG_RUNTIME_DIR/bgmix.sock)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: lifecycle events, -vv: every event)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a duration string into seconds.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds,
/// fractions allowed), single-unit (`500ms`, `3s`, `2m`), and compound (`1m30s`).
fn parse_secs(s: &str) -> Result<f64, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(secs);
        }
        return Err(format!("invalid duration: {}", s));
    }
    humantime::parse_duration(s)
        .map(|d| d.as_secs_f64())
        .map_err(|e| e.to_string())
}

/// Options shared by the commands that mix speech.
#[derive(clap::Args, Debug, Clone)]
pub struct MixOptions {
    /// Background track (default: track.path from config)
    #[arg(long, short = 'b', value_name = "FILE")]
    pub background: Option<PathBuf>,

    /// Keep the background at the ambient level under speech
    #[arg(long)]
    pub no_ducking: bool,

    /// Background gain under speech, 0.0 to 1.0 (default: ducking.level)
    #[arg(long, value_name = "LEVEL")]
    pub duck_level: Option<f32>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mix speech over the background track and write the audio to stdout
    Mix {
        /// Text to speak
        text: String,

        #[command(flatten)]
        options: MixOptions,

        /// Output format: wav, mp3 or pcm (default: output.format)
        #[arg(long, short = 'f', value_name = "FORMAT")]
        format: Option<OutputFormat>,
    },

    /// Write the background track to stdout, looping past its end
    Background {
        /// Stop after this long (e.g., 10, 2.5, 30s, 1m)
        #[arg(long, short = 'd', value_name = "DURATION", value_parser = parse_secs)]
        duration: Option<f64>,

        /// Output format: wav, mp3 or pcm (default: output.format)
        #[arg(long, short = 'f', value_name = "FORMAT")]
        format: Option<OutputFormat>,
    },

    /// Print the daemon's current background offset
    Offset,

    /// Run the continuous stream in this process: raw PCM to stdout, one
    /// line of speech per line of stdin
    Stream,

    /// Start the daemon (foreground process for service managers)
    Daemon,

    /// Queue speech on the daemon's continuous stream
    Say {
        /// Text to speak
        text: String,
    },

    /// Mix speech through the daemon and write the audio to stdout
    Play {
        /// Text to speak
        text: String,

        #[command(flatten)]
        options: MixOptions,
    },

    /// Write the daemon's continuous stream (raw PCM) to stdout
    Listen,

    /// Duck the daemon's continuous stream for a while
    Duck {
        /// How long to hold the duck (default: ducking.restore_after_secs)
        #[arg(value_name = "DURATION", value_parser = parse_secs)]
        duration: Option<f64>,
    },

    /// Start the daemon's continuous stream
    Start,

    /// Stop the daemon's continuous stream
    Stop,

    /// Get daemon status
    Status,

    /// Print what the classifier heard so far
    Transcript,

    /// Shut the daemon down
    Shutdown,

    /// Check which speech and mixing engines are available
    Check,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Get a configuration value by key (e.g., track.duration_secs)
    Get {
        /// Dotted key path (e.g., ducking.level, synth.engines.0.program)
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mix_defaults() {
        let cli = Cli::try_parse_from(["bgmix", "mix", "hello world"]).unwrap();
        match cli.command {
            Commands::Mix {
                text,
                options,
                format,
            } => {
                assert_eq!(text, "hello world");
                assert!(options.background.is_none());
                assert!(!options.no_ducking);
                assert!(options.duck_level.is_none());
                assert!(format.is_none());
            }
            other => panic!("Expected Mix command, got {:?}", other),
        }
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
        assert!(cli.socket.is_none());
    }

    #[test]
    fn test_parse_mix_with_options() {
        let cli = Cli::try_parse_from([
            "bgmix",
            "mix",
            "goal",
            "--background",
            "/music/game.wav",
            "--no-ducking",
            "--duck-level",
            "0.3",
            "--format",
            "pcm",
        ])
        .unwrap();
        match cli.command {
            Commands::Mix {
                options, format, ..
            } => {
                assert_eq!(options.background, Some(PathBuf::from("/music/game.wav")));
                assert!(options.no_ducking);
                assert_eq!(options.duck_level, Some(0.3));
                assert_eq!(format, Some(OutputFormat::Pcm));
            }
            other => panic!("Expected Mix command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_mix_rejects_unknown_format() {
        let result = Cli::try_parse_from(["bgmix", "mix", "x", "--format", "flac"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mix_requires_text() {
        let err = Cli::try_parse_from(["bgmix", "mix"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_parse_background_duration_forms() {
        for (arg, expected) in [("10", 10.0), ("2.5", 2.5), ("500ms", 0.5), ("1m", 60.0)] {
            let cli = Cli::try_parse_from(["bgmix", "background", "-d", arg]).unwrap();
            match cli.command {
                Commands::Background { duration, .. } => assert_eq!(duration, Some(expected)),
                other => panic!("Expected Background command, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_secs_rejects_negative() {
        assert!(parse_secs("-1").is_err());
        assert!(parse_secs("soon").is_err());
    }

    #[test]
    fn test_parse_duck_optional_duration() {
        let cli = Cli::try_parse_from(["bgmix", "duck"]).unwrap();
        assert!(matches!(cli.command, Commands::Duck { duration: None }));
        let cli = Cli::try_parse_from(["bgmix", "duck", "5s"]).unwrap();
        assert!(matches!(cli.command, Commands::Duck { duration: Some(d) } if d == 5.0));
    }

    #[test]
    fn test_parse_verbose_double() {
        let cli = Cli::try_parse_from(["bgmix", "-vv", "daemon"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Daemon));
    }

    #[test]
    fn test_global_options_after_command() {
        let cli = Cli::try_parse_from([
            "bgmix",
            "say",
            "hi",
            "--socket",
            "/tmp/test.sock",
            "--config",
            "/tmp/config.toml",
            "-q",
        ])
        .unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/test.sock")));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/config.toml")));
        assert!(cli.quiet);
    }

    #[test]
    fn test_parse_config_get() {
        let cli = Cli::try_parse_from(["bgmix", "config", "get", "ducking.level"]).unwrap();
        match cli.command {
            Commands::Config {
                action: ConfigAction::Get { key },
            } => assert_eq!(key, "ducking.level"),
            other => panic!("Expected Config Get, got {:?}", other),
        }
    }

    #[test]
    fn test_config_requires_subcommand() {
        let err = Cli::try_parse_from(["bgmix", "config"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["bgmix"]).is_err());
    }

    #[test]
    fn test_invalid_command_returns_error() {
        let err = Cli::try_parse_from(["bgmix", "record"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["bgmix", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
