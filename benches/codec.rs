//! Criterion benchmarks for the chunk codec hot path.
//!
//! Compression throughput decides how many workers a capture needs to keep up with the
//! device: at 20 MS/s the pipeline must sustain 80 MB/s of sc16 data.
//!
//! Key metrics:
//! - Compress throughput per method and level
//! - Decompress + checksum throughput (the replay side)
//! - Full capture round through `compress_chunk`
//!
//! Run with: cargo bench --bench codec

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rf_recorder::core::{RawChunk, SampleBuffer};
use rf_recorder::data::codec::{checksum, Codec, Compression};
use rf_recorder::hardware::mock::{MockSource, MockSourceConfig, Waveform};
use rf_recorder::hardware::{Direction, ReadOutcome, SampleDevice, StreamParams};
use rf_recorder::pipeline::monitor::StageCounters;
use rf_recorder::pipeline::workers::compress_chunk;

const BUFFER_SAMPLES: usize = 8192;
const BUFFERS_PER_CHUNK: usize = 32;

/// One chunk worth of noisy tone, which compresses like real off-air IQ.
fn tone_chunk() -> RawChunk {
    let mut source = MockSource::new(MockSourceConfig {
        waveform: Waveform::Tone,
        noise: 0.05,
        seed: 42,
        ..Default::default()
    });
    source
        .start_streaming(&StreamParams {
            direction: Direction::Rx,
            sample_rate_hz: 2e6,
            center_frequency_hz: 100e6,
            gain_db: 0.0,
            buffer_samples: BUFFER_SAMPLES,
        })
        .unwrap();
    let buffers = (0..BUFFERS_PER_CHUNK as u64)
        .map(|sequence| match source.read_buffer(BUFFER_SAMPLES).unwrap() {
            ReadOutcome::Samples(samples) => SampleBuffer::new(sequence, samples),
            other => panic!("unexpected read outcome {other:?}"),
        })
        .collect();
    RawChunk {
        ordinal: 0,
        buffers,
    }
}

fn codecs() -> Vec<(String, Codec)> {
    vec![
        ("none".to_string(), Codec::new(Compression::None, None).unwrap()),
        ("gzip-1".to_string(), Codec::new(Compression::Gzip, Some(1)).unwrap()),
        ("gzip-6".to_string(), Codec::new(Compression::Gzip, Some(6)).unwrap()),
        ("zstd-1".to_string(), Codec::new(Compression::Zstd, Some(1)).unwrap()),
        ("zstd-3".to_string(), Codec::new(Compression::Zstd, Some(3)).unwrap()),
        ("zstd-9".to_string(), Codec::new(Compression::Zstd, Some(9)).unwrap()),
    ]
}

/// Benchmark compressing one chunk with every method.
fn codec_compress(c: &mut Criterion) {
    let raw = tone_chunk().to_le_bytes();
    let mut group = c.benchmark_group("codec_compress");
    group.throughput(Throughput::Bytes(raw.len() as u64));

    for (name, codec) in codecs() {
        group.bench_with_input(BenchmarkId::new("compress", &name), &raw, |b, raw| {
            b.iter(|| black_box(codec.compress(black_box(raw)).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark the replay side: checksum then decompress.
fn codec_decompress(c: &mut Criterion) {
    let raw = tone_chunk().to_le_bytes();
    let mut group = c.benchmark_group("codec_decompress");
    group.throughput(Throughput::Bytes(raw.len() as u64));

    for (name, codec) in codecs() {
        let payload = codec.compress(&raw).unwrap();
        group.bench_with_input(BenchmarkId::new("verify_decompress", &name), &payload, |b, payload| {
            b.iter(|| {
                black_box(checksum(payload));
                black_box(codec.decompress(payload, raw.len()).unwrap())
            });
        });
    }
    group.finish();
}

/// Benchmark a complete compression-stage unit of work.
fn compress_chunk_round(c: &mut Criterion) {
    let chunk = tone_chunk();
    let counters = StageCounters::default();
    let codec = Codec::default();
    let mut group = c.benchmark_group("compress_chunk");
    group.throughput(Throughput::Bytes(chunk.sample_count() * 4));
    group.bench_function("zstd_default", |b| {
        b.iter(|| black_box(compress_chunk(black_box(&chunk), &codec, &counters).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, codec_compress, codec_decompress, compress_chunk_round);
criterion_main!(benches);
