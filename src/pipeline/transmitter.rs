//! Paced transmitter: the replay end of the pipeline.
//!
//! ```text
//! Idle ──start_streaming──▶ Priming ──prime_depth queued──▶ Streaming
//!                                                              │
//!                            Stopped ◀──device.stop── Draining ◀┘ input closed / stop
//! ```
//!
//! On a device whose `write_buffer` blocks at the hardware sample clock, pacing is implicit.
//! Otherwise the [`Pacer`] computes each write's deadline from the cumulative number of
//! samples sent, measured from a single monotonic start instant, so rounding never
//! accumulates into drift.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{SampleBuffer, BYTES_PER_SAMPLE};
use crate::error::{DeviceError, PipelineError, Result};
use crate::hardware::capabilities::{SampleDevice, StreamParams, WriteOutcome};
use crate::pipeline::monitor::{OverflowKind, OverflowMonitor, StageCounters, WarnThrottle};
use crate::pipeline::queue::{BoundedSampleQueue, PopTimeout};
use crate::pipeline::stop::StopSignal;

/// Longest single sleep, so a stop is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Transmitter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitState {
    /// Constructed, device not started
    Idle,
    /// Waiting for the input queue to fill to the prime depth
    Priming,
    /// Writing buffers
    Streaming,
    /// Letting the last buffer play out and flushing the device
    Draining,
    /// Device stopped and released
    Stopped,
}

/// Deadline computation for a non-blocking sink.
#[derive(Debug, Clone)]
pub struct Pacer {
    sample_rate_hz: f64,
    start: Instant,
    sent: u64,
}

impl Pacer {
    /// Pacer whose clock starts at `start`.
    pub fn new(sample_rate_hz: f64, start: Instant) -> Self {
        Self {
            sample_rate_hz,
            start,
            sent: 0,
        }
    }

    /// Instant at which the sample with cumulative index `samples` is due.
    pub fn deadline_for(&self, samples: u64) -> Instant {
        self.start + Duration::from_secs_f64(samples as f64 / self.sample_rate_hz)
    }

    /// Deadline for the next write.
    pub fn next_deadline(&self) -> Instant {
        self.deadline_for(self.sent)
    }

    /// Account `samples` as sent.
    pub fn advance(&mut self, samples: u64) {
        self.sent += samples;
    }

    /// Samples accounted so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Sleep until the next deadline. Returns `false` if `stop` fired first.
    pub fn wait(&self, stop: &StopSignal) -> bool {
        let deadline = self.next_deadline();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if stop.wait_timeout((deadline - now).min(WAIT_SLICE)) {
                return false;
            }
        }
    }
}

/// What a transmitter run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransmitSummary {
    /// Buffers written
    pub buffers: u64,
    /// Complex samples written
    pub samples: u64,
    /// Underruns reported by the device
    pub underruns: u64,
    /// First write to end of draining
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Stopped before the input was exhausted
    pub cancelled: bool,
}

/// Drives a transmit device from the raw replay queue.
pub struct PacedTransmitter {
    device: Option<Box<dyn SampleDevice>>,
    params: StreamParams,
    prime_depth: usize,
    input: Arc<BoundedSampleQueue<SampleBuffer>>,
    monitor: Arc<OverflowMonitor>,
    counters: Arc<StageCounters>,
    stop: Arc<StopSignal>,
    state: TransmitState,
}

impl PacedTransmitter {
    /// Create an idle transmitter. The device is started by [`run`](Self::run).
    pub fn new(
        device: Box<dyn SampleDevice>,
        params: StreamParams,
        prime_depth: usize,
        input: Arc<BoundedSampleQueue<SampleBuffer>>,
        monitor: Arc<OverflowMonitor>,
        stop: Arc<StopSignal>,
    ) -> Self {
        let counters = monitor.register_stage("transmitter");
        Self {
            device: Some(device),
            params,
            prime_depth: prime_depth.max(1),
            input,
            monitor,
            counters,
            stop,
            state: TransmitState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransmitState {
        self.state
    }

    fn enter(&mut self, state: TransmitState) {
        debug!(from = ?self.state, to = ?state, "Transmitter state");
        self.state = state;
    }

    fn device(&mut self) -> Result<&mut Box<dyn SampleDevice>> {
        self.device.as_mut().ok_or_else(|| {
            PipelineError::Device(DeviceError::NotStreaming {
                message: "transmitter already stopped".to_string(),
            })
        })
    }

    /// Run the whole state machine to `Stopped`.
    ///
    /// The device is always stopped and released, also on error. The input queue is closed on
    /// exit so upstream stages never block on a transmitter that is gone.
    pub fn run(&mut self) -> Result<TransmitSummary> {
        if self.state != TransmitState::Idle {
            return Err(PipelineError::Configuration(
                "transmitter can only run once".to_string(),
            ));
        }

        let outcome = self.prime_and_stream();
        let drained = match &outcome {
            Ok(Some(streamed)) if !streamed.summary.cancelled => self.drain(streamed),
            // Cancelled: flush what the device holds, without waiting for playout.
            Ok(_) => {
                self.enter(TransmitState::Draining);
                self.flush()
            }
            Err(_) => {
                self.enter(TransmitState::Draining);
                Ok(())
            }
        };
        self.input.close();

        self.enter(TransmitState::Stopped);
        let stopped = match self.device.take() {
            Some(mut device) => device.stop().map_err(PipelineError::from),
            None => Ok(()),
        };

        let summary = match outcome? {
            Some(streamed) => TransmitSummary {
                elapsed: streamed.pacer.start.elapsed(),
                ..streamed.summary
            },
            None => TransmitSummary {
                cancelled: true,
                ..TransmitSummary::default()
            },
        };
        drained?;
        stopped?;
        info!(
            samples = summary.samples,
            buffers = summary.buffers,
            underruns = summary.underruns,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            cancelled = summary.cancelled,
            "Transmitter stopped"
        );
        Ok(summary)
    }

    /// `None` if stopped while priming.
    fn prime_and_stream(&mut self) -> Result<Option<Streamed>> {
        let requested = self.params.clone();
        let applied = self.device()?.start_streaming(&requested)?;
        let paced_by_device = self.device()?.paces_output();
        let description = self.device()?.describe();
        info!(
            device = %description,
            rate = applied.sample_rate_hz,
            freq = applied.center_frequency_hz,
            paced_by_device,
            "Transmit stream started"
        );

        self.enter(TransmitState::Priming);
        loop {
            if self.stop.is_stopped() {
                return Ok(None);
            }
            let depth = self.input.wait_for_depth(self.prime_depth, WAIT_SLICE);
            if depth >= self.prime_depth || self.input.is_closed() {
                debug!(depth, "Transmitter primed");
                break;
            }
        }

        self.enter(TransmitState::Streaming);
        let mut summary = TransmitSummary::default();
        let mut pacer = Pacer::new(applied.sample_rate_hz, Instant::now());
        let mut underrun_warning = WarnThrottle::new(Duration::from_secs(1));
        let device_counters = self.monitor.device();
        loop {
            if self.stop.is_stopped() {
                summary.cancelled = true;
                break;
            }
            let buffer = match self.input.pop_timeout(WAIT_SLICE) {
                PopTimeout::Item(buffer) => buffer,
                PopTimeout::TimedOut => continue,
                PopTimeout::Closed => break,
            };
            if !paced_by_device && !pacer.wait(&self.stop) {
                summary.cancelled = true;
                break;
            }

            let samples = buffer.len() as u64;
            if self.device()?.write_buffer(&buffer)? == WriteOutcome::Underrun {
                summary.underruns += 1;
                self.monitor.record_overflow(OverflowKind::DeviceUnderrun);
                if let Some(suppressed) = underrun_warning.ready() {
                    warn!(sequence = buffer.sequence, suppressed, "Transmit underrun");
                }
            }
            device_counters.record_buffer(samples);
            self.counters
                .record_out(samples, samples * BYTES_PER_SAMPLE as u64);
            pacer.advance(samples);
            summary.buffers += 1;
            summary.samples += samples;
        }
        Ok(Some(Streamed {
            summary,
            pacer,
            paced_by_device,
        }))
    }

    fn drain(&mut self, streamed: &Streamed) -> Result<()> {
        self.enter(TransmitState::Draining);
        if !streamed.paced_by_device {
            // Let the final buffer play out at the nominal rate.
            streamed.pacer.wait(&self.stop);
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.device()?.flush()?;
        Ok(())
    }
}

struct Streamed {
    summary: TransmitSummary,
    pacer: Pacer,
    paced_by_device: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Direction;
    use crate::hardware::mock::MemorySink;
    use crate::pipeline::queue::OverflowPolicy;

    fn params(rate: f64, buffer: usize) -> StreamParams {
        StreamParams {
            direction: Direction::Tx,
            sample_rate_hz: rate,
            center_frequency_hz: 915e6,
            gain_db: 0.0,
            buffer_samples: buffer,
        }
    }

    fn filled_queue(
        monitor: &OverflowMonitor,
        buffers: u64,
        samples: usize,
    ) -> Arc<BoundedSampleQueue<SampleBuffer>> {
        let queue = Arc::new(BoundedSampleQueue::new(
            "raw",
            buffers as usize,
            OverflowPolicy::Block,
            monitor,
        ));
        for seq in 0..buffers {
            queue
                .push(SampleBuffer::new(seq, vec![seq as i16; samples * 2]))
                .unwrap();
        }
        queue.close();
        queue
    }

    #[test]
    fn test_pacer_deadlines_do_not_drift() {
        let start = Instant::now();
        let mut pacer = Pacer::new(3e6, start);
        for _ in 0..3000 {
            pacer.advance(1000);
        }
        // 3M samples at 3 MS/s is exactly one second, however the steps were sized.
        assert_eq!(pacer.next_deadline() - start, Duration::from_secs(1));
        assert_eq!(pacer.sent(), 3_000_000);
    }

    #[test]
    fn test_streams_everything_and_stops_device() {
        let monitor = Arc::new(OverflowMonitor::default());
        let input = filled_queue(&monitor, 10, 100);
        let (sink, probe) = MemorySink::new();
        let mut tx = PacedTransmitter::new(
            Box::new(sink),
            params(1e6, 100),
            4,
            input,
            Arc::clone(&monitor),
            Arc::new(StopSignal::new()),
        );
        assert_eq!(tx.state(), TransmitState::Idle);

        let summary = tx.run().unwrap();
        assert_eq!(tx.state(), TransmitState::Stopped);
        assert_eq!(summary.samples, 1000);
        assert_eq!(summary.buffers, 10);
        assert!(!summary.cancelled);
        assert_eq!(probe.sequences(), (0..10).collect::<Vec<_>>());
        assert_eq!(probe.flushes(), 1);
        assert!(probe.stopped());
        assert_eq!(monitor.snapshot().device.samples, 1000);
    }

    #[test]
    fn test_paced_duration() {
        let monitor = Arc::new(OverflowMonitor::default());
        // 20 x 5000 samples at 500 kS/s = 200 ms.
        let input = filled_queue(&monitor, 20, 5000);
        let (sink, _probe) = MemorySink::new();
        let mut tx = PacedTransmitter::new(
            Box::new(sink),
            params(500e3, 5000),
            4,
            input,
            Arc::clone(&monitor),
            Arc::new(StopSignal::new()),
        );
        let summary = tx.run().unwrap();
        let elapsed = summary.elapsed.as_secs_f64();
        assert!((0.196..0.24).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn test_stop_abandons_queued_buffers() {
        let monitor = Arc::new(OverflowMonitor::default());
        // 100 buffers of 10 ms each; stop after ~50 ms.
        let input = filled_queue(&monitor, 100, 1000);
        let (sink, probe) = MemorySink::new();
        let stop = Arc::new(StopSignal::new());
        let mut tx = PacedTransmitter::new(
            Box::new(sink),
            params(100e3, 1000),
            1,
            input,
            Arc::clone(&monitor),
            Arc::clone(&stop),
        );
        let stopper = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.stop(crate::pipeline::stop::StopReason::Requested);
            })
        };
        let summary = tx.run().unwrap();
        stopper.join().unwrap();

        assert!(summary.cancelled);
        assert!(summary.buffers < 100);
        assert_eq!(probe.sample_count(), summary.samples);
        assert_eq!(probe.flushes(), 1);
        assert!(probe.stopped());
    }

    #[test]
    fn test_underruns_are_counted_not_fatal() {
        let monitor = Arc::new(OverflowMonitor::default());
        let input = filled_queue(&monitor, 9, 10);
        let (sink, _probe) = MemorySink::new();
        let mut tx = PacedTransmitter::new(
            Box::new(sink.with_underrun_every(3)),
            params(1e6, 10),
            2,
            input,
            Arc::clone(&monitor),
            Arc::new(StopSignal::new()),
        );
        let summary = tx.run().unwrap();
        assert_eq!(summary.underruns, 3);
        assert_eq!(monitor.snapshot().device.underruns, 3);
    }
}
