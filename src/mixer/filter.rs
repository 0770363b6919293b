//! Command lines for the mixing engine (ffmpeg-compatible CLI).

use crate::audio::format::{AudioSpec, OutputFormat};
use crate::mixer::ducking::MixParameters;
use crate::process::CommandLine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How long a mixed segment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixMode {
    /// The mix ends when the speech ends.
    #[default]
    TruncateToSpeech,
    /// The background loops and the mix runs for a fixed segment length,
    /// with speech laid over its start.
    LoopBackground,
}

impl fmt::Display for MixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            MixMode::TruncateToSpeech => "truncate_to_speech",
            MixMode::LoopBackground => "loop_background",
        })
    }
}

impl FromStr for MixMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "truncate_to_speech" | "truncate" => Ok(MixMode::TruncateToSpeech),
            "loop_background" | "loop" => Ok(MixMode::LoopBackground),
            other => Err(format!(
                "unknown mix mode '{other}' (expected truncate_to_speech or loop_background)"
            )),
        }
    }
}

/// Inputs for a speech-over-music mix.
#[derive(Debug, Clone)]
pub struct MixArgs<'a> {
    pub track: &'a Path,
    pub offset_secs: f64,
    pub params: MixParameters,
    pub mode: MixMode,
    /// Length bound for [`MixMode::LoopBackground`].
    pub segment_secs: Option<f64>,
    pub format: OutputFormat,
    pub spec: AudioSpec,
    /// Read inputs at their native rate instead of as fast as possible.
    pub realtime: bool,
}

/// Inputs for a music-only stream.
#[derive(Debug, Clone)]
pub struct BackgroundArgs<'a> {
    pub track: &'a Path,
    pub offset_secs: f64,
    pub gain: f32,
    /// Stop after this many seconds; `None` streams until killed.
    pub seconds: Option<f64>,
    pub format: OutputFormat,
    pub spec: AudioSpec,
    pub realtime: bool,
}

/// Filter graph: input 0 is speech, input 1 is the background track.
pub fn filter_graph(params: &MixParameters, mode: MixMode) -> String {
    let duration = match mode {
        MixMode::TruncateToSpeech => "first",
        MixMode::LoopBackground => "longest",
    };
    format!(
        "[1:a]volume={}[bg];[0:a]volume={}[fg];[fg][bg]amix=inputs=2:duration={duration}:dropout_transition=0",
        params.background_gain, params.foreground_gain
    )
}

/// Speech on stdin, background from `track` at `offset_secs`, mix on stdout.
pub fn mix_command(program: &str, args: &MixArgs<'_>) -> CommandLine {
    let mut cmd = base(program);
    if args.realtime {
        cmd = cmd.arg("-re");
    }
    cmd = cmd.args(["-f", "wav", "-i", "pipe:0"]);

    if args.realtime {
        cmd = cmd.arg("-re");
    }
    if args.mode == MixMode::LoopBackground {
        cmd = cmd.args(["-stream_loop", "-1"]);
    }
    cmd = cmd
        .arg("-ss")
        .arg(format_secs(args.offset_secs))
        .arg("-i")
        .arg(args.track.to_string_lossy())
        .arg("-filter_complex")
        .arg(filter_graph(&args.params, args.mode));

    if let (MixMode::LoopBackground, Some(secs)) = (args.mode, args.segment_secs) {
        cmd = cmd.arg("-t").arg(format_secs(secs));
    }
    output(cmd, args.format, &args.spec)
}

/// Background track alone, looping past its end, at a fixed gain.
pub fn background_command(program: &str, args: &BackgroundArgs<'_>) -> CommandLine {
    let mut cmd = base(program).arg("-nostdin");
    if args.realtime {
        cmd = cmd.arg("-re");
    }
    cmd = cmd
        .args(["-stream_loop", "-1"])
        .arg("-ss")
        .arg(format_secs(args.offset_secs))
        .arg("-i")
        .arg(args.track.to_string_lossy())
        .arg("-filter:a")
        .arg(format!("volume={}", args.gain));

    if let Some(secs) = args.seconds {
        cmd = cmd.arg("-t").arg(format_secs(secs));
    }
    output(cmd, args.format, &args.spec)
}

fn base(program: &str) -> CommandLine {
    CommandLine::new(program).args(["-hide_banner", "-loglevel", "error"])
}

fn output(cmd: CommandLine, format: OutputFormat, spec: &AudioSpec) -> CommandLine {
    let cmd = cmd.arg("-f").arg(format.muxer());
    let cmd = match format {
        OutputFormat::Wav | OutputFormat::Pcm => cmd.args(["-c:a", "pcm_s16le"]),
        OutputFormat::Mp3 => cmd,
    };
    cmd.arg("-ac")
        .arg(spec.channels.to_string())
        .arg("-ar")
        .arg(spec.sample_rate.to_string())
        .arg("pipe:1")
}

/// Millisecond precision is below one 8kHz chunk.
fn format_secs(secs: f64) -> String {
    format!("{:.3}", secs.max(0.0))
}
