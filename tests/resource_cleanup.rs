//! Repeated mix cycles must not leak file descriptors or child processes,
//! whether the consumer reads to the end or walks away early.

mod common;

use bgmix::engine::AudioEngine;
use common::{config_with, engine_with, write_script, write_tone};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;

const CYCLES: usize = 100;

// Descriptor and child counts are process-wide
static SERIAL: Mutex<()> = Mutex::new(());

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn child_processes() -> Vec<Pid> {
    let me = sysinfo::get_current_pid().unwrap();
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .filter(|(_, p)| p.thread_kind().is_none() && p.parent() == Some(me))
        .map(|(pid, _)| *pid)
        .collect()
}

fn gone(pids: &[u32]) -> bool {
    let pids: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    pids.iter().all(|pid| system.process(*pid).is_none())
}

fn settle(baseline: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let now = child_processes().len();
        if now <= baseline || Instant::now() > deadline {
            return now;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn engine(dir: &Path, mixer_body: &str) -> AudioEngine {
    let speech = dir.join("speech.wav");
    let track = dir.join("game.wav");
    write_tone(&speech, 200);
    write_tone(&track, 1000);
    let mixer = write_script(dir, "mixer", mixer_body);
    let (engine, _clock, _rx) = engine_with(config_with(&speech, &mixer, Some(&track)));
    engine
}

fn assert_no_growth(fds_before: usize, children_before: usize) {
    let fds_after = open_fds();
    assert!(
        fds_after <= fds_before + 2,
        "file descriptors grew from {fds_before} to {fds_after}"
    );
    let children_after = settle(children_before);
    assert!(
        children_after <= children_before,
        "child processes grew from {children_before} to {children_after}"
    );
}

#[test]
fn completed_mixes_release_pipes_and_children() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path(), "exec cat");

    let run = || {
        let mut stream = engine.mix("cycle", None, true, 0.15).unwrap();
        let pids = stream.process_ids();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert!(!out.is_empty());
        drop(stream);
        assert!(gone(&pids), "children {pids:?} outlived their stream");
    };

    run();
    let fds = open_fds();
    let children = child_processes().len();
    for _ in 0..CYCLES {
        run();
    }
    assert_no_growth(fds, children);
}

#[test]
fn abandoned_mixes_kill_their_pipeline() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    // Never ends on its own: the consumer has to tear it down
    let engine = engine(dir.path(), "cat >/dev/null\nexec cat /dev/zero");

    let run = || {
        let mut stream = engine.mix("cycle", None, true, 0.15).unwrap();
        let pids = stream.process_ids();
        let first = stream.next_chunk().unwrap().unwrap();
        assert_eq!(first.len(), 4096);
        drop(stream);
        assert!(gone(&pids), "children {pids:?} outlived their stream");
    };

    run();
    let fds = open_fds();
    let children = child_processes().len();
    for _ in 0..CYCLES {
        run();
    }
    assert_no_growth(fds, children);
}

#[test]
fn continuous_stream_restarts_release_background_children() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path(), "exec cat /dev/zero");

    let run = || {
        let rx = engine.subscribe();
        engine.start().unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        engine.stop();
    };

    run();
    let fds = open_fds();
    let children = child_processes().len();
    for _ in 0..CYCLES / 4 {
        run();
    }
    assert_no_growth(fds, children);
}
