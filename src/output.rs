//! Shared event rendering for terminal output.
//! Used by the logger thread in both one-shot commands and the daemon.

use crate::classify::{Summary, TranscriptEntry};
use crate::events::{EngineEvent, FallbackKind};

const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Render one event to stderr.
pub fn render_event(event: &EngineEvent) {
    eprintln!("{}", format_event(event));
}

/// Render one event as a single terminal line (with ANSI colors).
pub fn format_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::ServiceStarted {
            track,
            track_duration_secs,
        } => {
            let track = track.as_deref().unwrap_or("(none)");
            format!("{GREEN}Stream started{RESET} {DIM}track={track} duration={track_duration_secs:.1}s{RESET}")
        }
        EngineEvent::ServiceStopped => "Stream stopped".to_string(),
        EngineEvent::StateChanged { from, to } => format!("{DIM}state {from} -> {to}{RESET}"),
        EngineEvent::SpeechQueued { text, pending } => {
            format!("Queued speech ({pending} pending): {text}")
        }
        EngineEvent::SpeechDropped { text, reason } => {
            format!("{YELLOW}Dropped speech ({reason}): {text}{RESET}")
        }
        EngineEvent::MixStarted {
            offset_secs,
            background_gain,
            foreground_gain,
            mode,
        } => format!(
            "{DIM}mix at {offset_secs:.3}s bg={background_gain:.2} fg={foreground_gain:.2} mode={mode}{RESET}"
        ),
        EngineEvent::MixFinished { bytes, chunks } => {
            format!("{DIM}mix finished: {bytes} bytes in {chunks} chunks{RESET}")
        }
        EngineEvent::BackgroundOpened { offset_secs, gain } => {
            format!("{DIM}background at {offset_secs:.3}s gain={gain:.2}{RESET}")
        }
        EngineEvent::EngineSelected { engine } => format!("{DIM}speech engine: {engine}{RESET}"),
        EngineEvent::EngineUnavailable { engine } => {
            format!("{DIM}{engine} not available, trying next{RESET}")
        }
        EngineEvent::SilenceFallback { millis } => {
            format!("{YELLOW}No speech engine available, using {millis}ms of silence{RESET}")
        }
        EngineEvent::Fallback { kind, reason } => {
            let kind = match kind {
                FallbackKind::BackgroundOnly => "music only",
                FallbackKind::SpeechOnly => "speech only",
            };
            format!("{YELLOW}Degraded to {kind}: {reason}{RESET}")
        }
        EngineEvent::EngineCrashed { engine, status } => {
            format!("{RED}{engine} exited with {status}{RESET}")
        }
        EngineEvent::ConsumerDisconnected => format!("{DIM}consumer disconnected{RESET}"),
        EngineEvent::VolumeDucked {
            level,
            restore_after_secs,
        } => format!("Ducked background to {level:.2} for {restore_after_secs:.1}s"),
        EngineEvent::VolumeRestored { level } => format!("Restored background to {level:.2}"),
        EngineEvent::AudioDetected {
            audio_type,
            elapsed_secs,
        } => format!("{DIM}[{elapsed_secs:>7.1}s] {audio_type}{RESET}"),
        EngineEvent::Warning { message } => format!("{YELLOW}Warning: {message}{RESET}"),
    }
}

/// Serialize an event as one JSON line for machine consumers.
pub fn event_to_json(event: &EngineEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        format!("{{\"type\":\"warning\",\"message\":\"unserializable event: {e}\"}}")
    })
}

/// Plain-text transcript line, as printed by `bgmix transcript`.
pub fn format_entry(entry: &TranscriptEntry) -> String {
    format!(
        "[{:>8.1}s] {:<7} {}",
        entry.elapsed_secs, entry.classified_type, entry.text
    )
}

/// Multi-line transcript summary.
pub fn format_summary(summary: &Summary) -> String {
    let mut out = format!("Entries: {}\n", summary.total_entries);
    for (audio_type, count) in &summary.counts {
        out.push_str(&format!("  {audio_type:<7} {count}\n"));
    }
    if !summary.recent.is_empty() {
        out.push_str("Recent:\n");
        for entry in &summary.recent {
            out.push_str("  ");
            out.push_str(&format_entry(entry));
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AudioType;
    use crate::mixer::filter::MixMode;
    use crate::stream::StreamState;

    #[test]
    fn format_mix_started_includes_offset_and_gains() {
        let line = format_event(&EngineEvent::MixStarted {
            offset_secs: 5.25,
            background_gain: 0.15,
            foreground_gain: 1.0,
            mode: MixMode::TruncateToSpeech,
        });
        assert!(line.contains("5.250s"));
        assert!(line.contains("bg=0.15"));
        assert!(line.contains("fg=1.00"));
        assert!(line.contains("truncate_to_speech"));
    }

    #[test]
    fn format_state_change_uses_display_names() {
        let line = format_event(&EngineEvent::StateChanged {
            from: StreamState::Streaming,
            to: StreamState::Mixing,
        });
        assert!(line.contains("streaming -> mixing"));
    }

    #[test]
    fn format_fallback_names_surviving_half() {
        let line = format_event(&EngineEvent::Fallback {
            kind: FallbackKind::SpeechOnly,
            reason: "ffmpeg missing".to_string(),
        });
        assert!(line.contains("speech only"));
        assert!(line.contains("ffmpeg missing"));
    }

    #[test]
    fn every_event_renders_without_panicking() {
        let events = vec![
            EngineEvent::ServiceStarted {
                track: None,
                track_duration_secs: 159.0,
            },
            EngineEvent::ServiceStopped,
            EngineEvent::SpeechQueued {
                text: "hi".to_string(),
                pending: 1,
            },
            EngineEvent::SpeechDropped {
                text: "hi".to_string(),
                reason: "queue full".to_string(),
            },
            EngineEvent::MixFinished {
                bytes: 4096,
                chunks: 1,
            },
            EngineEvent::BackgroundOpened {
                offset_secs: 1.0,
                gain: 0.35,
            },
            EngineEvent::EngineSelected {
                engine: "espeak".to_string(),
            },
            EngineEvent::EngineUnavailable {
                engine: "espeak".to_string(),
            },
            EngineEvent::SilenceFallback { millis: 1000 },
            EngineEvent::EngineCrashed {
                engine: "ffmpeg".to_string(),
                status: "exit status: 1".to_string(),
            },
            EngineEvent::ConsumerDisconnected,
            EngineEvent::VolumeDucked {
                level: 0.15,
                restore_after_secs: 3.0,
            },
            EngineEvent::VolumeRestored { level: 0.35 },
            EngineEvent::AudioDetected {
                audio_type: AudioType::Music,
                elapsed_secs: 2.0,
            },
            EngineEvent::warning("careful"),
        ];
        for event in &events {
            assert!(!format_event(event).is_empty());
            render_event(event);
        }
    }

    #[test]
    fn event_to_json_is_single_line() {
        let json = event_to_json(&EngineEvent::SilenceFallback { millis: 1000 });
        assert!(!json.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "silence_fallback");
        assert_eq!(value["millis"], 1000);
    }

    #[test]
    fn format_entry_pads_type() {
        let entry = TranscriptEntry {
            timestamp_unix_ms: 0,
            elapsed_secs: 12.5,
            classified_type: AudioType::Speech,
            text: "Speech detected".to_string(),
        };
        assert_eq!(format_entry(&entry), "[    12.5s] speech  Speech detected");
    }
}
