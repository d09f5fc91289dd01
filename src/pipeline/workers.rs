//! Compression and decompression worker pools.
//!
//! Both pools follow the same shape: N named threads pop a unit from the input queue,
//! transform it, and hand the result to a [`Sequencer`] under the unit's ordinal. The
//! sequencer restores order before the downstream queue, so the pools never coordinate with
//! each other. Each worker holds a [`ProducerGuard`]; when the last one exits the downstream
//! queue closes and the consumer sees end-of-stream.
//!
//! Capture workers always drain their input so a cancelled session persists everything that
//! was acquired. Replay workers stop taking new chunks as soon as the session is stopped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::config::GapPolicy;
use crate::core::{Chunk, RawChunk, SampleBuffer, SequenceRange, BYTES_PER_SAMPLE};
use crate::data::chunk_file::IndexRecord;
use crate::data::codec::{checksum, checksum_hex, Codec};
use crate::error::{PipelineError, Result};
use crate::pipeline::monitor::{OverflowMonitor, StageCounters};
use crate::pipeline::queue::BoundedSampleQueue;
use crate::pipeline::reorder::{ProducerGuard, Sequencer};
use crate::pipeline::stop::StopSignal;

/// A chunk read back from disk, not yet verified.
#[derive(Debug)]
pub struct StoredChunk {
    /// Dense position in the replay plan
    pub ordinal: u64,
    /// Index entry the payload was read for
    pub record: IndexRecord,
    /// Stored payload bytes
    pub payload: Vec<u8>,
}

/// A set of named worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` threads named `{prefix}-{i}`, each running `work`.
    pub fn spawn<F>(prefix: &str, count: usize, work: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("{prefix}-{i}");
            let work = Arc::clone(&work);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || work())
                .map_err(|source| PipelineError::Spawn { name, source })?;
            handles.push(handle);
        }
        debug!(pool = prefix, workers = count, "Worker pool started");
        Ok(Self { handles })
    }

    /// Number of threads in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if the pool has no threads.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker. Reports the first panicked thread.
    pub fn join(self) -> Result<()> {
        let mut panicked = None;
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Worker thread panicked");
                panicked.get_or_insert(name);
            }
        }
        match panicked {
            Some(name) => Err(PipelineError::ThreadPanicked(name)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Compression
// =============================================================================

/// Capture-side pool: raw buffer runs in, checksummed chunks out.
pub struct CompressionStage;

impl CompressionStage {
    /// Start `workers` compression threads.
    pub fn spawn(
        workers: usize,
        buffers_per_chunk: usize,
        codec: Codec,
        input: Arc<BoundedSampleQueue<SampleBuffer>>,
        sequencer: Arc<Sequencer<Chunk>>,
        counters: Arc<StageCounters>,
        stop: Arc<StopSignal>,
    ) -> Result<WorkerPool> {
        WorkerPool::spawn("rf-compress", workers, move || {
            let _guard = ProducerGuard::new(Arc::clone(&sequencer));
            while let Some(run) = input.pop_run(buffers_per_chunk) {
                let raw = RawChunk {
                    ordinal: run.ordinal,
                    buffers: run.items,
                };
                match compress_chunk(&raw, &codec, &counters) {
                    Ok(Some(chunk)) => {
                        if sequencer.submit(raw.ordinal, vec![chunk]).is_err() {
                            debug!(ordinal = raw.ordinal, "Chunk output closed");
                            break;
                        }
                    }
                    Ok(None) => {
                        if sequencer.skip(raw.ordinal).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(ordinal = raw.ordinal, error = %e, "Compression failed");
                        stop.fail(e);
                        sequencer.abort();
                        input.close();
                        break;
                    }
                }
            }
        })
    }
}

/// Compress one run of buffers. `None` for an empty run.
pub fn compress_chunk(
    raw: &RawChunk,
    codec: &Codec,
    counters: &StageCounters,
) -> Result<Option<Chunk>> {
    let Some(range) = raw.range() else {
        return Ok(None);
    };
    let bytes = raw.to_le_bytes();
    counters.record_in(bytes.len() as u64);

    let payload = codec
        .compress(&bytes)
        .map_err(|e| PipelineError::Compression {
            ordinal: raw.ordinal,
            message: e.to_string(),
        })?;
    let sample_count = raw.sample_count();
    counters.record_out(sample_count, payload.len() as u64);
    trace!(
        ordinal = raw.ordinal,
        range = %range,
        raw = bytes.len(),
        compressed = payload.len(),
        "Chunk compressed"
    );
    Ok(Some(Chunk {
        ordinal: raw.ordinal,
        range,
        sample_count,
        checksum: checksum(&payload),
        payload,
    }))
}

// =============================================================================
// Decompression
// =============================================================================

/// How stored chunks are turned back into device buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    /// Codec the recording was written with
    pub codec: Codec,
    /// Complex samples per output buffer
    pub buffer_samples: usize,
    /// Amplitude scale factor
    pub scale: f32,
    /// Only emit buffers inside this range
    pub range: Option<SequenceRange>,
    /// What to do with a chunk that fails verification
    pub on_gap: GapPolicy,
}

/// Replay-side pool: stored chunks in, sample buffers out.
pub struct DecompressionStage;

impl DecompressionStage {
    /// Start `workers` decompression threads.
    pub fn spawn(
        workers: usize,
        options: DecodeOptions,
        input: Arc<BoundedSampleQueue<StoredChunk>>,
        sequencer: Arc<Sequencer<SampleBuffer>>,
        monitor: Arc<OverflowMonitor>,
        counters: Arc<StageCounters>,
        stop: Arc<StopSignal>,
    ) -> Result<WorkerPool> {
        WorkerPool::spawn("rf-decompress", workers, move || {
            let _guard = ProducerGuard::new(Arc::clone(&sequencer));
            while let Some(stored) = input.pop() {
                if stop.is_stopped() {
                    break;
                }
                let ordinal = stored.ordinal;
                let range = stored.record.range;
                counters.record_in(stored.payload.len() as u64);

                let outcome = match decode_chunk(&stored, &options) {
                    Ok(buffers) => {
                        let samples = buffers.iter().map(|b| b.len() as u64).sum();
                        counters.record_out(samples, samples * BYTES_PER_SAMPLE as u64);
                        sequencer.submit(ordinal, buffers)
                    }
                    Err(e) => {
                        if matches!(e, PipelineError::ChecksumMismatch { .. }) {
                            monitor.record_checksum_failure();
                        }
                        if options.on_gap == GapPolicy::Skip && e.is_chunk_local() {
                            warn!(range = %range, error = %e, "Skipping unreadable chunk");
                            monitor.record_gap(range);
                            sequencer.skip(ordinal)
                        } else {
                            error!(range = %range, error = %e, "Chunk failed verification");
                            stop.fail(e);
                            sequencer.abort();
                            input.close();
                            break;
                        }
                    }
                };
                if outcome.is_err() {
                    debug!(ordinal, "Sample output closed");
                    break;
                }
            }
        })
    }
}

/// Verify, decompress, split and scale one stored chunk.
pub fn decode_chunk(stored: &StoredChunk, options: &DecodeOptions) -> Result<Vec<SampleBuffer>> {
    let record = &stored.record;
    let actual = checksum(&stored.payload);
    if actual != record.checksum {
        return Err(PipelineError::ChecksumMismatch {
            range: record.range,
            expected: checksum_hex(&record.checksum),
            actual: checksum_hex(&actual),
        });
    }

    let expected_len = record.sample_count as usize * BYTES_PER_SAMPLE;
    let raw = options
        .codec
        .decompress(&stored.payload, expected_len)
        .map_err(|e| PipelineError::Compression {
            ordinal: stored.ordinal,
            message: e.to_string(),
        })?;

    let mut samples = SampleBuffer::samples_from_le_bytes(&raw);
    if options.scale != 1.0 {
        scale_samples(&mut samples, options.scale);
    }

    // Buffers are fixed-length apart from the session's last one, so the stored samples
    // split back onto the recorded sequence numbers exactly.
    let per_buffer = options.buffer_samples.max(1) * 2;
    let blocks = samples.len().div_ceil(per_buffer) as u64;
    if blocks != record.range.len() {
        return Err(PipelineError::Compression {
            ordinal: stored.ordinal,
            message: format!(
                "{} samples do not fill sequences {} at {} samples per buffer",
                samples.len() / 2,
                record.range,
                options.buffer_samples
            ),
        });
    }
    Ok(samples
        .chunks(per_buffer)
        .enumerate()
        .map(|(i, block)| (record.range.start + i as u64, block))
        .filter(|(sequence, _)| options.range.map_or(true, |r| r.contains(*sequence)))
        .map(|(sequence, block)| SampleBuffer::new(sequence, block.to_vec()))
        .collect())
}

/// Multiply every component by `scale`, saturating at the `i16` range.
pub fn scale_samples(samples: &mut [i16], scale: f32) {
    for v in samples {
        *v = (f32::from(*v) * scale)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}
