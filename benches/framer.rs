//! Framer throughput benchmarks
//!
//! Measures the resample and downmix paths on 20 ms chunks, the shape
//! speaker sockets typically deliver.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use polyglot_captions::audio::{AudioChunk, Framer};
use polyglot_captions::config::FramerConfig;

fn tone(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i as f32) * 0.01).sin() * 0.4).collect()
}

fn framer_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for rate in [16_000u32, 44_100, 48_000] {
        let samples = tone(rate as usize / 50);
        group.throughput(Throughput::Elements(samples.len() as u64));
        group.bench_function(format!("mono_{rate}"), |b| {
            let mut framer = Framer::new(&FramerConfig::default());
            b.iter(|| {
                let chunk = AudioChunk::new(samples.clone(), rate, 1);
                black_box(framer.push_chunk(&chunk).unwrap());
            });
        });
    }

    let stereo = tone(1_920);
    group.throughput(Throughput::Elements(stereo.len() as u64));
    group.bench_function("stereo_48000", |b| {
        let mut framer = Framer::new(&FramerConfig::default());
        b.iter(|| {
            let chunk = AudioChunk::new(stereo.clone(), 48_000, 2);
            black_box(framer.push_chunk(&chunk).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, framer_benches);
criterion_main!(benches);
