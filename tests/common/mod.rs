//! Fixtures shared by the integration tests: WAV files written with hound
//! and fake engine scripts.

#![allow(dead_code)]

use bgmix::audio::clock::ManualClock;
use bgmix::config::Config;
use bgmix::engine::AudioEngine;
use bgmix::events::{EngineEvent, EventSender};
use bgmix::synth::CommandSynthesizer;
use crossbeam_channel::Receiver;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes a mono 16-bit 8kHz tone of `millis` milliseconds.
pub fn write_tone(path: &Path, millis: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = 8000 * millis / 1000;
    for n in 0..frames {
        let t = n as f32 / 8000.0;
        let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 8000.0;
        writer.write_sample(sample as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Writes an executable `/bin/sh` script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Mixer stand-in: records its arguments one per line, then echoes stdin.
pub fn recording_mixer(dir: &Path) -> (PathBuf, PathBuf) {
    let args = dir.join("mixer-args");
    let script = write_script(
        dir,
        "fake-mixer",
        &format!("printf '%s\\n' \"$@\" > '{}'\nexec cat", args.display()),
    );
    (script, args)
}

/// Config whose only speech engine is `cat <speech>`.
pub fn config_with(speech: &Path, mixer: &Path, track: Option<&Path>) -> Config {
    let mut config = Config::default();
    config.synth.engines = vec![bgmix::synth::EngineSpec::new(
        "fake-tts",
        "cat",
        &[&speech.to_string_lossy()],
    )];
    config.mixer.program = mixer.to_string_lossy().into_owned();
    config.track.path = track.map(Path::to_path_buf);
    config.classifier.enabled = false;
    config.stream.realtime = false;
    config
}

/// Engine with the command synthesizer, a manual clock and a collecting
/// event channel.
pub fn engine_with(config: Config) -> (AudioEngine, ManualClock, Receiver<EngineEvent>) {
    let (events, rx) = EventSender::channel(1024);
    let clock = ManualClock::new();
    let synth = CommandSynthesizer::new(config.synth_settings(), events.clone());
    let engine =
        AudioEngine::with_parts(config, Arc::new(synth), Arc::new(clock.clone()), events).unwrap();
    (engine, clock, rx)
}
