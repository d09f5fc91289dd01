//! Session controller.
//!
//! A session owns every queue, worker, file and the device for one capture or one replay. It
//! is started with [`start_capture`] or [`start_replay`] and controlled through the returned
//! [`SessionHandle`].
//!
//! ## Threads
//!
//! | Thread | Capture | Replay |
//! |--------|---------|--------|
//! | device | `rf-acquire` | `rf-transmit` |
//! | workers | `rf-compress-N` | `rf-decompress-N` |
//! | storage | `rf-writer` | `rf-reader` |
//! | control | `rf-supervisor` | `rf-supervisor` |
//!
//! The supervisor enforces the wall-clock duration and the degraded policy, waits for every
//! stage, finalizes the [`SessionMetadata`] and produces the report returned by
//! [`SessionHandle::join`].
//!
//! ## Termination
//!
//! Every path ends the same way: the [`StopSignal`] is set, queues close from the device side
//! inward, workers drain, and the storage or transmit stage performs its clean shutdown. A
//! capture therefore always leaves a valid (possibly shorter) recording whose metadata
//! `samples` equals the samples actually persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{CaptureConfig, GapPolicy, ReplayConfig};
use crate::core::{Chunk, SampleBuffer, SequenceRange};
use crate::data::chunk_file::{ChunkReader, ChunkWriter, PlanStep, SessionPaths, WriterSummary};
use crate::data::codec::Codec;
use crate::data::metadata::{Finalization, SessionMetadata, SessionStatus};
use crate::error::{PipelineError, Result};
use crate::hardware::capabilities::{Direction, ReadOutcome, SampleDevice, StreamParams};
use crate::pipeline::monitor::{
    OverflowKind, OverflowMonitor, PipelineStats, StageCounters, WarnThrottle,
};
use crate::pipeline::queue::{BoundedSampleQueue, OverflowPolicy, QueueClosed};
use crate::pipeline::reorder::Sequencer;
use crate::pipeline::stop::{StopReason, StopSignal};
use crate::pipeline::transmitter::PacedTransmitter;
use crate::pipeline::workers::{CompressionStage, DecodeOptions, DecompressionStage, StoredChunk};

/// Supervisor polling interval.
const SUPERVISOR_TICK: Duration = Duration::from_millis(25);

/// Slack added to a capture's wall-clock deadline. The sample target ends the capture; the
/// deadline only catches a source that stalls.
const CAPTURE_DEADLINE_GRACE: Duration = Duration::from_millis(500);

/// Direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Device to disk
    Capture,
    /// Disk to device
    Replay,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Capture or replay
    pub kind: SessionKind,
    /// Finalized metadata
    pub metadata: SessionMetadata,
    /// Why the session stopped
    pub stop_reason: Option<StopReason>,
    /// Final counters
    pub stats: PipelineStats,
    /// Ranges skipped during replay
    pub skipped: Vec<SequenceRange>,
    /// Recording base path
    pub recording: PathBuf,
}

impl SessionReport {
    /// Samples persisted (capture) or transmitted (replay).
    pub fn samples(&self) -> u64 {
        self.metadata.samples.unwrap_or(0)
    }
}

/// A session that ended in error. The report still describes exactly what was persisted
/// or transmitted.
#[derive(Debug, Error)]
#[error("{kind:?} session failed: {error}")]
pub struct SessionFailure {
    /// Session direction
    pub kind: SessionKind,
    /// The first fault
    #[source]
    pub error: PipelineError,
    /// Finalized report
    pub report: Box<SessionReport>,
}

type SessionOutcome = std::result::Result<SessionReport, SessionFailure>;

/// Control surface of a running session.
pub struct SessionHandle {
    id: Uuid,
    kind: SessionKind,
    stop: Arc<StopSignal>,
    monitor: Arc<OverflowMonitor>,
    supervisor: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Session id, also written to the metadata.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Capture or replay.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Request a cooperative stop.
    pub fn cancel(&self) {
        if self.stop.stop(StopReason::Requested) {
            info!(session = %self.id, "Session cancellation requested");
        }
    }

    /// Shared stop signal, for cancelling from another thread or a signal handler.
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Live counters.
    pub fn stats(&self) -> PipelineStats {
        self.monitor.snapshot()
    }

    /// Whether every stage has exited.
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait for the session to end.
    pub fn join(self) -> SessionOutcome {
        match self.supervisor.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                // The supervisor itself panicked; nothing finalized the metadata.
                error!(session = %self.id, "Session supervisor panicked");
                let metadata = SessionMetadata::new(0.0, 0.0, 0.0, Default::default(), 0)
                    .finalize(Finalization {
                        status: Some(SessionStatus::Failed),
                        ..Default::default()
                    });
                Err(SessionFailure {
                    kind: self.kind,
                    error: PipelineError::ThreadPanicked("rf-supervisor".to_string()),
                    report: Box::new(SessionReport {
                        kind: self.kind,
                        metadata,
                        stop_reason: self.stop.reason(),
                        stats: self.monitor.snapshot(),
                        skipped: Vec::new(),
                        recording: PathBuf::new(),
                    }),
                })
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

fn spawn_stage<T, F>(name: &str, work: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(work)
        .map_err(|source| PipelineError::Spawn {
            name: name.to_string(),
            source,
        })
}

/// Join a stage thread, recording a panic as a fault.
fn join_stage<T>(name: &str, handle: JoinHandle<T>, stop: &StopSignal) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(thread = name, "Stage thread panicked");
            stop.fail(PipelineError::ThreadPanicked(name.to_string()));
            None
        }
    }
}

/// Poll the duration deadline and the degraded predicate until the session stops.
fn supervise(stop: &StopSignal, monitor: &OverflowMonitor, deadline: Option<Instant>, abort_on_degraded: bool) {
    let mut was_degraded = false;
    while !stop.is_stopped() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Session duration elapsed");
            stop.stop(StopReason::DurationElapsed);
            break;
        }
        let degraded = monitor.degraded();
        if degraded && !was_degraded {
            let events = monitor.events_in_window();
            let window_ms = monitor.threshold().window.as_millis() as u64;
            warn!(events, window_ms, "Pipeline degraded");
            if abort_on_degraded {
                stop.stop(StopReason::Degraded);
                stop.fail(PipelineError::Degraded { events, window_ms });
                break;
            }
        } else if !degraded && was_degraded {
            info!("Pipeline recovered from degraded state");
        }
        was_degraded = degraded;
        stop.wait_timeout(SUPERVISOR_TICK);
    }
}

fn final_status(stop: &StopSignal) -> SessionStatus {
    if stop.has_fault() {
        return SessionStatus::Failed;
    }
    match stop.reason() {
        Some(StopReason::Requested) => SessionStatus::Cancelled,
        Some(StopReason::Degraded | StopReason::Fault) => SessionStatus::Failed,
        _ => SessionStatus::Completed,
    }
}

fn conclude(
    kind: SessionKind,
    report: SessionReport,
    stop: &StopSignal,
    late_error: Option<PipelineError>,
) -> SessionOutcome {
    let fault = stop.take_fault().or(late_error);
    match fault {
        None => {
            info!(
                session = %report.metadata.session_id,
                samples = report.samples(),
                status = report.metadata.status.as_str(),
                "Session finished"
            );
            Ok(report)
        }
        Some(error) => {
            error!(
                session = %report.metadata.session_id,
                samples = report.samples(),
                error = %error,
                "Session failed"
            );
            Err(SessionFailure {
                kind,
                error,
                report: Box::new(report),
            })
        }
    }
}

// =============================================================================
// Capture
// =============================================================================

#[derive(Debug, Default)]
struct AcquisitionSummary {
    buffers: u64,
    samples: u64,
}

/// Start a capture session writing to `config.output`.
///
/// Configuration and file-creation errors are returned immediately; everything after the
/// threads start is reported through [`SessionHandle::join`].
pub fn start_capture(config: CaptureConfig, device: Box<dyn SampleDevice>) -> Result<SessionHandle> {
    config.validate()?;
    let paths = SessionPaths::new(&config.output);
    let writer = ChunkWriter::create(paths.clone())?;

    let monitor = Arc::new(OverflowMonitor::new(config.degraded));
    let stop = Arc::new(StopSignal::new());
    let raw = Arc::new(BoundedSampleQueue::<SampleBuffer>::new(
        "raw",
        config.raw_queue_capacity,
        OverflowPolicy::DropOldest,
        &monitor,
    ));
    let compressed = Arc::new(BoundedSampleQueue::<Chunk>::new(
        "compressed",
        config.compressed_queue_capacity,
        OverflowPolicy::Block,
        &monitor,
    ));
    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&compressed),
        config.reorder_span,
        config.workers,
    ));

    let metadata = SessionMetadata::new(
        config.center_frequency_hz,
        config.sample_rate_hz,
        config.gain_db,
        config.codec.compression(),
        config.codec.level(),
    )
    .with_threads(config.workers)
    .with_buffer_samples(config.buffer_samples);
    let id = metadata.session_id;
    info!(
        session = %id,
        output = %paths.base.display(),
        device = %device.describe(),
        rate = config.sample_rate_hz,
        freq = config.center_frequency_hz,
        compression = %config.codec.compression(),
        workers = config.workers,
        "Starting capture"
    );

    let abort_startup = |e: PipelineError| {
        stop.stop(StopReason::Fault);
        raw.close();
        sequencer.abort();
        e
    };

    let writer_thread = {
        let compressed = Arc::clone(&compressed);
        let stop = Arc::clone(&stop);
        let counters = monitor.register_stage("writer");
        spawn_stage("rf-writer", move || run_writer(writer, &compressed, &stop, &counters))?
    };
    let pool = CompressionStage::spawn(
        config.workers,
        config.buffers_per_chunk,
        config.codec,
        Arc::clone(&raw),
        Arc::clone(&sequencer),
        monitor.register_stage("compression"),
        Arc::clone(&stop),
    )
    .map_err(abort_startup)?;

    let params = StreamParams {
        direction: Direction::Rx,
        sample_rate_hz: config.sample_rate_hz,
        center_frequency_hz: config.center_frequency_hz,
        gain_db: config.gain_db,
        buffer_samples: config.buffer_samples,
    };
    let target = config.target_samples();
    let acquire_thread = {
        let raw = Arc::clone(&raw);
        let monitor = Arc::clone(&monitor);
        let stop = Arc::clone(&stop);
        spawn_stage("rf-acquire", move || {
            run_acquisition(device, &params, target, &raw, &monitor, &stop)
        })
        .map_err(abort_startup)?
    };

    let deadline = config.duration.map(|d| {
        let buffer_period = Duration::from_secs_f64(
            config.buffer_samples as f64 / config.sample_rate_hz,
        );
        Instant::now() + d + buffer_period * 2 + CAPTURE_DEADLINE_GRACE
    });
    let supervisor = {
        let stop = Arc::clone(&stop);
        let monitor = Arc::clone(&monitor);
        spawn_stage("rf-supervisor", move || {
            supervise(&stop, &monitor, deadline, config.abort_on_degraded);
            let acquired = join_stage("rf-acquire", acquire_thread, &stop).unwrap_or_default();
            if let Err(e) = pool.join() {
                stop.fail(e);
            }
            let written = join_stage("rf-writer", writer_thread, &stop).unwrap_or_default();
            finish_capture(metadata, &config, paths, acquired, written, &stop, &monitor)
        })
        .map_err(abort_startup)?
    };

    Ok(SessionHandle {
        id,
        kind: SessionKind::Capture,
        stop,
        monitor,
        supervisor,
    })
}

/// Collects device reads into fixed-length buffers.
///
/// A device may return fewer samples than asked for; the sequence number is only assigned
/// once a full `buffer_samples` block is held, so buffer `n` always starts at sample
/// `n * buffer_samples`. Only the last buffer of a session can be short.
#[derive(Debug)]
struct BufferAssembler {
    buffer_samples: usize,
    pending: Vec<i16>,
}

impl BufferAssembler {
    fn new(buffer_samples: usize) -> Self {
        Self {
            buffer_samples,
            pending: Vec::with_capacity(buffer_samples * 2),
        }
    }

    /// Complex samples held for the next buffer.
    fn held(&self) -> usize {
        self.pending.len() / 2
    }

    /// Complex samples missing from the next buffer.
    fn wanted(&self) -> usize {
        self.buffer_samples - self.held()
    }

    /// Append one read; returns the buffer's samples once it is full.
    fn extend(&mut self, samples: &[i16]) -> Option<Vec<i16>> {
        let take = samples.len().min(self.wanted() * 2) & !1;
        self.pending.extend_from_slice(&samples[..take]);
        if self.held() == self.buffer_samples {
            self.take()
        } else {
            None
        }
    }

    /// Whatever is held, full or not.
    fn take(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            return None;
        }
        let next = Vec::with_capacity(self.buffer_samples * 2);
        Some(std::mem::replace(&mut self.pending, next))
    }
}

/// Acquisition-side state shared by the read loop and the final flush.
struct Acquisition<'a> {
    raw: &'a BoundedSampleQueue<SampleBuffer>,
    monitor: &'a OverflowMonitor,
    assembler: BufferAssembler,
    summary: AcquisitionSummary,
    drop_warning: WarnThrottle,
}

impl Acquisition<'_> {
    /// Sequence and enqueue one assembled buffer. `false` once the raw queue is closed.
    fn publish(&mut self, samples: Vec<i16>) -> bool {
        let buffer = SampleBuffer::new(self.summary.buffers, samples);
        let len = buffer.len() as u64;
        match self.raw.push(buffer) {
            Ok(dropped) => {
                self.summary.buffers += 1;
                self.summary.samples += len;
                if let Some(dropped) = dropped {
                    self.monitor.record_overflow(OverflowKind::QueueDrop);
                    if let Some(suppressed) = self.drop_warning.ready() {
                        warn!(
                            sequence = dropped.sequence,
                            suppressed,
                            "Raw queue full, dropped oldest buffer"
                        );
                    }
                }
                true
            }
            Err(QueueClosed(_)) => {
                debug!("Raw queue closed under acquisition");
                false
            }
        }
    }

    /// Publish the trailing partial buffer, if any.
    fn flush(&mut self) {
        if let Some(samples) = self.assembler.take() {
            trace!(samples = samples.len() / 2, "Publishing short final buffer");
            self.publish(samples);
        }
    }
}

fn run_acquisition(
    mut device: Box<dyn SampleDevice>,
    params: &StreamParams,
    target: Option<u64>,
    raw: &BoundedSampleQueue<SampleBuffer>,
    monitor: &OverflowMonitor,
    stop: &StopSignal,
) -> AcquisitionSummary {
    let mut acquisition = Acquisition {
        raw,
        monitor,
        assembler: BufferAssembler::new(params.buffer_samples),
        summary: AcquisitionSummary::default(),
        drop_warning: WarnThrottle::new(Duration::from_secs(1)),
    };
    let result = acquire(device.as_mut(), params, target, &mut acquisition, stop);
    acquisition.flush();
    raw.close();
    let stopped = device.stop();
    drop(device);

    if let Err(e) = result {
        error!(error = %e, "Acquisition failed");
        stop.fail(e);
    } else if let Err(e) = stopped {
        stop.fail(e.into());
    }
    let summary = acquisition.summary;
    info!(
        buffers = summary.buffers,
        samples = summary.samples,
        "Acquisition stopped"
    );
    summary
}

fn acquire(
    device: &mut dyn SampleDevice,
    params: &StreamParams,
    target: Option<u64>,
    acquisition: &mut Acquisition<'_>,
    stop: &StopSignal,
) -> Result<()> {
    let applied = device.start_streaming(params)?;
    if (applied.sample_rate_hz - params.sample_rate_hz).abs() > f64::EPSILON {
        warn!(
            requested = params.sample_rate_hz,
            applied = applied.sample_rate_hz,
            "Device applied a different sample rate"
        );
    }
    let monitor = acquisition.monitor;
    let device_counters = monitor.device();
    let mut overrun_warning = WarnThrottle::new(Duration::from_secs(1));

    while !stop.is_stopped() {
        let held = acquisition.assembler.held() as u64;
        let remaining = target.map(|t| t.saturating_sub(acquisition.summary.samples + held));
        if remaining == Some(0) {
            acquisition.flush();
            info!(samples = acquisition.summary.samples, "Capture sample target reached");
            stop.stop(StopReason::Completed);
            break;
        }
        let wanted = acquisition.assembler.wanted();
        let capacity = remaining.map_or(wanted, |r| wanted.min(r as usize));

        match device.read_buffer(capacity)? {
            ReadOutcome::Samples(mut samples) => {
                samples.truncate(capacity * 2);
                if samples.len() < 2 {
                    continue;
                }
                device_counters.record_buffer((samples.len() / 2) as u64);
                if let Some(full) = acquisition.assembler.extend(&samples) {
                    if !acquisition.publish(full) {
                        break;
                    }
                }
            }
            ReadOutcome::Overrun => {
                monitor.record_overflow(OverflowKind::DeviceOverrun);
                if let Some(suppressed) = overrun_warning.ready() {
                    warn!(suppressed, "Device overrun");
                }
            }
            ReadOutcome::Timeout => device_counters.record_timeout(),
            ReadOutcome::EndOfStream => {
                info!(
                    samples = acquisition.summary.samples + acquisition.assembler.held() as u64,
                    "Source reached end of stream"
                );
                stop.stop(StopReason::Completed);
                break;
            }
        }
    }
    Ok(())
}

fn run_writer(
    mut writer: ChunkWriter,
    input: &BoundedSampleQueue<Chunk>,
    stop: &StopSignal,
    counters: &StageCounters,
) -> WriterSummary {
    let mut failed = false;
    while let Some(chunk) = input.pop() {
        counters.record_in(chunk.payload.len() as u64);
        match writer.append(&chunk) {
            Ok(record) => counters.record_out(record.sample_count, record.byte_length),
            Err(e) => {
                error!(error = %e, "Chunk write failed");
                stop.fail(e.into());
                input.close();
                failed = true;
                break;
            }
        }
    }

    let partial = writer.summary().clone();
    match writer.finish() {
        Ok(summary) => {
            if !failed {
                stop.stop(StopReason::Completed);
            }
            summary
        }
        Err(e) => {
            stop.fail(e.into());
            partial
        }
    }
}

fn finish_capture(
    metadata: SessionMetadata,
    config: &CaptureConfig,
    paths: SessionPaths,
    acquired: AcquisitionSummary,
    written: WriterSummary,
    stop: &StopSignal,
    monitor: &OverflowMonitor,
) -> SessionOutcome {
    let stats = monitor.snapshot();
    let metadata = metadata.finalize(Finalization {
        duration_seconds: written.samples as f64 / config.sample_rate_hz,
        samples: written.samples,
        chunks: written.chunks,
        overflow_count: stats.overflow_events,
        original_size_bytes: written.original_bytes,
        compressed_size_bytes: written.compressed_bytes,
        status: Some(final_status(stop)),
    });
    debug!(
        acquired = acquired.samples,
        persisted = written.samples,
        buffers = acquired.buffers,
        "Capture totals"
    );

    let late_error = metadata.write(&paths.meta).err().map(PipelineError::from);
    let report = SessionReport {
        kind: SessionKind::Capture,
        metadata,
        stop_reason: stop.reason(),
        stats,
        skipped: Vec::new(),
        recording: paths.base,
    };
    conclude(SessionKind::Capture, report, stop, late_error)
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug, Default)]
struct ReaderSummary {
    chunks: u64,
    bytes: u64,
}

/// Start replaying the recording at `path` (base path or any of its three files).
///
/// The recording's metadata supplies the sample rate, center frequency, gain and codec
/// unless `config` overrides them.
pub fn start_replay(
    path: impl AsRef<Path>,
    config: ReplayConfig,
    device: Box<dyn SampleDevice>,
) -> Result<SessionHandle> {
    config.validate()?;
    let paths = SessionPaths::new(path);
    let recorded = SessionMetadata::load(&paths.meta)?;
    let reader = ChunkReader::open(paths.clone())?;
    let codec = Codec::new(recorded.compression, Some(recorded.compression_level))?;

    let sample_rate_hz = config.sample_rate_hz.unwrap_or(recorded.sample_rate_hz);
    let center_frequency_hz = config
        .center_frequency_hz
        .unwrap_or(recorded.center_frequency_hz);
    let gain_db = config.gain_db.unwrap_or(recorded.gain_db);
    let buffer_samples = if recorded.buffer_samples > 0 {
        recorded.buffer_samples
    } else {
        config.buffer_samples
    };
    let params = StreamParams {
        direction: Direction::Tx,
        sample_rate_hz,
        center_frequency_hz,
        gain_db,
        buffer_samples,
    };
    params.validate()?;

    let steps = reader.plan_with_gaps(config.range);
    let monitor = Arc::new(OverflowMonitor::new(config.degraded));
    let stop = Arc::new(StopSignal::new());
    let compressed = Arc::new(BoundedSampleQueue::<StoredChunk>::new(
        "compressed",
        config.compressed_queue_capacity,
        OverflowPolicy::Block,
        &monitor,
    ));
    let raw = Arc::new(BoundedSampleQueue::<SampleBuffer>::new(
        "raw",
        config.raw_queue_capacity,
        OverflowPolicy::Block,
        &monitor,
    ));
    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&raw),
        config.reorder_span,
        config.workers,
    ));

    let metadata = SessionMetadata::new(
        center_frequency_hz,
        sample_rate_hz,
        gain_db,
        recorded.compression,
        recorded.compression_level,
    )
    .with_threads(config.workers)
    .with_buffer_samples(buffer_samples);
    let id = metadata.session_id;
    info!(
        session = %id,
        recording = %paths.base.display(),
        recorded_session = %recorded.session_id,
        device = %device.describe(),
        rate = sample_rate_hz,
        freq = center_frequency_hz,
        chunks = reader.records().len(),
        on_gap = %config.on_gap,
        "Starting replay"
    );

    let abort_startup = |e: PipelineError| {
        stop.stop(StopReason::Fault);
        compressed.close();
        sequencer.abort();
        e
    };

    let reader_thread = {
        let compressed = Arc::clone(&compressed);
        let stop = Arc::clone(&stop);
        let monitor = Arc::clone(&monitor);
        let on_gap = config.on_gap;
        spawn_stage("rf-reader", move || {
            run_reader(reader, steps, on_gap, &compressed, &monitor, &stop)
        })?
    };
    let pool = DecompressionStage::spawn(
        config.workers,
        DecodeOptions {
            codec,
            buffer_samples,
            scale: config.scale,
            range: config.range,
            on_gap: config.on_gap,
        },
        Arc::clone(&compressed),
        Arc::clone(&sequencer),
        Arc::clone(&monitor),
        monitor.register_stage("decompression"),
        Arc::clone(&stop),
    )
    .map_err(abort_startup)?;

    let transmit_thread = {
        let mut transmitter = PacedTransmitter::new(
            device,
            params,
            config.prime_depth,
            Arc::clone(&raw),
            Arc::clone(&monitor),
            Arc::clone(&stop),
        );
        let stop = Arc::clone(&stop);
        spawn_stage("rf-transmit", move || {
            match transmitter.run() {
                Ok(summary) => {
                    if !summary.cancelled {
                        stop.stop(StopReason::Completed);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Transmitter failed");
                    stop.fail(e);
                }
            }
        })
        .map_err(abort_startup)?
    };

    let deadline = config.duration.map(|d| Instant::now() + d);
    let supervisor = {
        let stop = Arc::clone(&stop);
        let monitor = Arc::clone(&monitor);
        let raw = Arc::clone(&raw);
        let compressed = Arc::clone(&compressed);
        spawn_stage("rf-supervisor", move || {
            supervise(&stop, &monitor, deadline, config.abort_on_degraded);
            join_stage("rf-transmit", transmit_thread, &stop);
            // Nothing downstream is left; unblock workers and the reader.
            raw.close();
            compressed.close();
            if let Err(e) = pool.join() {
                stop.fail(e);
            }
            let read = join_stage("rf-reader", reader_thread, &stop).unwrap_or_default();
            finish_replay(metadata, paths, read, &stop, &monitor)
        })
        .map_err(abort_startup)?
    };

    Ok(SessionHandle {
        id,
        kind: SessionKind::Replay,
        stop,
        monitor,
        supervisor,
    })
}

fn run_reader(
    mut reader: ChunkReader,
    steps: Vec<PlanStep>,
    on_gap: GapPolicy,
    output: &BoundedSampleQueue<StoredChunk>,
    monitor: &OverflowMonitor,
    stop: &StopSignal,
) -> ReaderSummary {
    let counters = monitor.register_stage("reader");
    let mut summary = ReaderSummary::default();
    for step in steps {
        if stop.is_stopped() {
            break;
        }
        match step {
            PlanStep::Gap(missing) => match on_gap {
                GapPolicy::Abort => {
                    error!(range = %missing, "Recording has a gap");
                    stop.fail(PipelineError::Gap { missing });
                    break;
                }
                GapPolicy::Skip => {
                    warn!(range = %missing, "Skipping gap in recording");
                    monitor.record_gap(missing);
                }
            },
            PlanStep::Chunk(record) => {
                let payload = match reader.read_payload(&record) {
                    Ok(payload) => payload,
                    Err(e) => {
                        stop.fail(e.into());
                        break;
                    }
                };
                counters.record_out(record.sample_count, record.byte_length);
                let stored = StoredChunk {
                    ordinal: summary.chunks,
                    record,
                    payload,
                };
                if output.push(stored).is_err() {
                    break;
                }
                summary.chunks += 1;
                summary.bytes += record.byte_length;
            }
        }
    }
    output.close();
    debug!(chunks = summary.chunks, "Reader finished");
    summary
}

fn finish_replay(
    metadata: SessionMetadata,
    paths: SessionPaths,
    read: ReaderSummary,
    stop: &StopSignal,
    monitor: &OverflowMonitor,
) -> SessionOutcome {
    let stats = monitor.snapshot();
    let transmitted = stats.stage("transmitter").map_or(0, |s| s.samples);
    let sample_rate_hz = metadata.sample_rate_hz;
    let metadata = metadata.finalize(Finalization {
        duration_seconds: transmitted as f64 / sample_rate_hz,
        samples: transmitted,
        chunks: read.chunks,
        overflow_count: stats.overflow_events,
        original_size_bytes: transmitted * crate::core::BYTES_PER_SAMPLE as u64,
        compressed_size_bytes: read.bytes,
        status: Some(final_status(stop)),
    });
    let report = SessionReport {
        kind: SessionKind::Replay,
        metadata,
        stop_reason: stop.reason(),
        stats,
        skipped: monitor.skipped_ranges(),
        recording: paths.base,
    };
    conclude(SessionKind::Replay, report, stop, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::codec::Compression;
    use crate::hardware::mock::{MemorySink, MockSource, MockSourceConfig, Waveform};
    use tempfile::TempDir;

    const RATE: f64 = 10e6;

    fn capture_config(dir: &TempDir, workers: usize) -> CaptureConfig {
        CaptureConfig::builder()
            .output(dir.path().join("session"))
            .sample_rate(RATE)
            .compression(Compression::Zstd, Some(1))
            .buffer_samples(1024)
            .buffers_per_chunk(4)
            .queue_capacities(1024, 8)
            .workers(workers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_assembler_fills_fixed_buffers() {
        let mut assembler = BufferAssembler::new(4);
        assert_eq!(assembler.extend(&[1, 1]), None);
        assert_eq!(assembler.wanted(), 3);
        assert_eq!(
            assembler.extend(&[2, 2, 3, 3, 4, 4]),
            Some(vec![1, 1, 2, 2, 3, 3, 4, 4])
        );
        assert_eq!(assembler.held(), 0);

        // Samples beyond the current buffer are never taken.
        assert_eq!(
            assembler.extend(&[5, 5, 6, 6, 7, 7, 8, 8, 9, 9]),
            Some(vec![5, 5, 6, 6, 7, 7, 8, 8])
        );
        assert_eq!(assembler.extend(&[9, 9]), None);
        assert_eq!(assembler.take(), Some(vec![9, 9]));
        assert_eq!(assembler.take(), None);
    }

    #[test]
    fn test_capture_persists_every_sample() {
        let dir = TempDir::new().unwrap();
        let handle =
            start_capture(capture_config(&dir, 2), Box::new(MockSource::ramp(50_000))).unwrap();
        let report = handle.join().unwrap();

        assert_eq!(report.kind, SessionKind::Capture);
        assert_eq!(report.samples(), 50_000);
        assert_eq!(report.metadata.status, SessionStatus::Completed);
        assert_eq!(report.stop_reason, Some(StopReason::Completed));

        let paths = SessionPaths::new(dir.path().join("session"));
        let stored = SessionMetadata::load(&paths.meta).unwrap();
        assert_eq!(stored.samples, Some(50_000));
        assert_eq!(stored.session_id, report.metadata.session_id);
        assert_eq!(ChunkReader::open(paths).unwrap().total_samples(), 50_000);
    }

    #[test]
    fn test_capture_duration_truncates_to_target() {
        let dir = TempDir::new().unwrap();
        let config = CaptureConfig::builder()
            .output(dir.path().join("timed"))
            .sample_rate(1e6)
            .duration(Duration::from_millis(20))
            .buffer_samples(3000)
            .buffers_per_chunk(2)
            .queue_capacities(64, 8)
            .workers(1)
            .build()
            .unwrap();
        let source = MockSource::new(MockSourceConfig {
            waveform: Waveform::Ramp,
            ..Default::default()
        });
        let report = start_capture(config, Box::new(source)).unwrap().join().unwrap();
        assert_eq!(report.samples(), 20_000);
        assert_eq!(report.metadata.status, SessionStatus::Completed);
    }

    #[test]
    fn test_device_fault_finalizes_failed_metadata() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new(MockSourceConfig {
            waveform: Waveform::Ramp,
            fail_after_reads: Some(10),
            ..Default::default()
        });
        let failure = start_capture(capture_config(&dir, 2), Box::new(source))
            .unwrap()
            .join()
            .unwrap_err();

        assert!(matches!(failure.error, PipelineError::Device(_)));
        assert_eq!(failure.report.metadata.status, SessionStatus::Failed);
        assert_eq!(failure.report.samples(), 10 * 1024);
    }

    #[test]
    fn test_replay_reproduces_capture() {
        let dir = TempDir::new().unwrap();
        start_capture(capture_config(&dir, 3), Box::new(MockSource::ramp(30_000)))
            .unwrap()
            .join()
            .unwrap();

        let (sink, probe) = MemorySink::new();
        let config = ReplayConfig::builder()
            .on_gap(GapPolicy::Abort)
            .workers(2)
            .build()
            .unwrap();
        let report = start_replay(dir.path().join("session"), config, Box::new(sink))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(report.kind, SessionKind::Replay);
        assert_eq!(report.samples(), 30_000);
        assert_eq!(probe.samples(), MockSource::ramp_samples(0, 30_000));
        assert!(probe.stopped());
    }

    #[test]
    fn test_cancel_stops_unbounded_capture() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new(MockSourceConfig {
            waveform: Waveform::Ramp,
            paced: true,
            ..Default::default()
        });
        let mut config = capture_config(&dir, 2);
        config.sample_rate_hz = 1e6;
        let handle = start_capture(config, Box::new(source)).unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.cancel();

        let report = handle.join().unwrap();
        assert_eq!(report.metadata.status, SessionStatus::Cancelled);
        assert_eq!(report.stop_reason, Some(StopReason::Requested));
        assert!(report.samples() > 0);
    }

    #[test]
    fn test_replay_missing_recording_fails_at_start() {
        let dir = TempDir::new().unwrap();
        let (sink, _probe) = MemorySink::new();
        let config = ReplayConfig::builder().on_gap(GapPolicy::Skip).build().unwrap();
        assert!(start_replay(dir.path().join("absent"), config, Box::new(sink)).is_err());
    }
}
