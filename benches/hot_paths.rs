use bgmix::audio::clock::{ManualClock, PlaybackClock};
use bgmix::audio::format::AudioSpec;
use bgmix::audio::wav;
use bgmix::classify::{Classifier, calculate_rms};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

/// One chunk of a 440Hz tone, 8kHz mono 16-bit.
fn tone_chunk(bytes: usize) -> Vec<u8> {
    (0..bytes / 2)
        .flat_map(|n| {
            let t = n as f32 / 8000.0;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            sample.to_le_bytes()
        })
        .collect()
}

fn bench_offset(c: &mut Criterion) {
    let clock = ManualClock::new();
    clock.advance(Duration::from_secs(12_345));
    let playback = PlaybackClock::with_clock(159.0, Arc::new(clock)).unwrap();

    c.bench_function("current_offset", |b| {
        b.iter(|| black_box(playback.current_offset()))
    });
}

fn bench_classify(c: &mut Criterion) {
    let classifier = Classifier::new(0.01);
    let mut group = c.benchmark_group("classify");
    for size in [1024, 4096, 16384] {
        let chunk = tone_chunk(size);
        group.bench_with_input(BenchmarkId::new("classify", size), &chunk, |b, chunk| {
            b.iter(|| black_box(classifier.classify(black_box(chunk))))
        });
        group.bench_with_input(BenchmarkId::new("rms", size), &chunk, |b, chunk| {
            b.iter(|| black_box(calculate_rms(black_box(chunk))))
        });
    }
    group.finish();
}

fn bench_silence(c: &mut Criterion) {
    let spec = AudioSpec::default();
    let mut group = c.benchmark_group("silence_wav");
    for millis in [100, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(millis), &millis, |b, &millis| {
            b.iter(|| black_box(wav::silence_wav(spec, millis).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_offset, bench_classify, bench_silence);
criterion_main!(benches);
