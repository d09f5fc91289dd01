//! Shared helpers for session-level integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rf_recorder::config::{CaptureConfig, GapPolicy, ReplayConfig};
use rf_recorder::core::{RawChunk, SampleBuffer};
use rf_recorder::data::chunk_file::{ChunkWriter, SessionPaths};
use rf_recorder::data::codec::{Codec, Compression};
use rf_recorder::data::metadata::{Finalization, SessionMetadata, SessionStatus};
use rf_recorder::hardware::mock::{MemorySink, MockSource, SinkProbe};
use rf_recorder::pipeline::monitor::StageCounters;
use rf_recorder::pipeline::workers::compress_chunk;
use rf_recorder::session::{start_capture, start_replay, SessionFailure, SessionReport};

pub const RATE: f64 = 4e6;
pub const BUFFER_SAMPLES: usize = 2048;

/// Capture settings that never drop: the raw queue holds the whole session.
pub fn lossless_capture(base: &Path, workers: usize, compression: Compression) -> CaptureConfig {
    CaptureConfig::builder()
        .output(base)
        .center_frequency(433.92e6)
        .sample_rate(RATE)
        .compression(compression, None)
        .buffer_samples(BUFFER_SAMPLES)
        .buffers_per_chunk(8)
        .queue_capacities(4096, 16)
        .workers(workers)
        .build()
        .expect("valid capture config")
}

/// Record `samples` ramp samples to `base`.
pub fn record_ramp(base: &Path, samples: u64, workers: usize) -> SessionReport {
    let config = lossless_capture(base, workers, Compression::Zstd);
    start_capture(config, Box::new(MockSource::ramp(samples)))
        .expect("capture starts")
        .join()
        .expect("capture completes")
}

pub fn replay_config(policy: GapPolicy, workers: usize) -> ReplayConfig {
    ReplayConfig::builder()
        .on_gap(policy)
        .workers(workers)
        .build()
        .expect("valid replay config")
}

/// Replay `base` into a memory sink.
pub fn replay_to_memory(
    base: &Path,
    config: ReplayConfig,
) -> (Result<SessionReport, SessionFailure>, SinkProbe) {
    let (sink, probe) = MemorySink::new();
    let outcome = start_replay(base, config, Box::new(sink))
        .expect("replay starts")
        .join();
    (outcome, probe)
}

/// Write a recording by hand whose chunks cover the given inclusive buffer ranges.
///
/// Buffer `s` holds ramp samples `s * buffer_samples ..`, so any hole in `ranges` is a gap.
pub fn write_recording(base: &Path, ranges: &[(u64, u64)], buffer_samples: usize) -> PathBuf {
    let paths = SessionPaths::new(base);
    let codec = Codec::new(Compression::Gzip, Some(1)).expect("codec");
    let counters = StageCounters::default();
    let mut writer = ChunkWriter::create(paths.clone()).expect("create recording");

    for (ordinal, &(start, end)) in ranges.iter().enumerate() {
        let buffers = (start..=end)
            .map(|sequence| {
                let first = sequence * buffer_samples as u64;
                SampleBuffer::new(
                    sequence,
                    MockSource::ramp_samples(first, buffer_samples as u64),
                )
            })
            .collect();
        let raw = RawChunk {
            ordinal: ordinal as u64,
            buffers,
        };
        let chunk = compress_chunk(&raw, &codec, &counters)
            .expect("compress")
            .expect("non-empty chunk");
        writer.append(&chunk).expect("append");
    }
    let summary = writer.finish().expect("finish");

    SessionMetadata::new(915e6, RATE, 0.0, Compression::Gzip, 1)
        .with_buffer_samples(buffer_samples)
        .finalize(Finalization {
            duration_seconds: summary.samples as f64 / RATE,
            samples: summary.samples,
            chunks: summary.chunks,
            overflow_count: 0,
            original_size_bytes: summary.original_bytes,
            compressed_size_bytes: summary.compressed_bytes,
            status: Some(SessionStatus::Completed),
        })
        .write(&paths.meta)
        .expect("write metadata");
    paths.base
}

/// Ramp samples for the listed buffer sequences.
pub fn expected_samples(sequences: impl IntoIterator<Item = u64>, buffer_samples: usize) -> Vec<i16> {
    sequences
        .into_iter()
        .flat_map(|s| MockSource::ramp_samples(s * buffer_samples as u64, buffer_samples as u64))
        .collect()
}
