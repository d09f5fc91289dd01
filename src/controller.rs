//! Controller-level composition of sessions.
//!
//! [`ReplayLoop`] replays one recording repeatedly. Every pass is an independent replay
//! session with its own queues and workers, so a loop restart always begins from Priming.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ReplayConfig;
use crate::error::{DeviceResult, PipelineError};
use crate::hardware::capabilities::SampleDevice;
use crate::pipeline::stop::{StopReason, StopSignal};
use crate::session::{start_replay, SessionFailure, SessionReport};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Pass reports kept by [`LoopReport`]; older passes only contribute to the totals.
pub const RECENT_PASSES: usize = 8;

/// Why a replay loop ended early.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Pass {pass} could not open the device: {source}")]
    Device {
        pass: u32,
        #[source]
        source: crate::error::DeviceError,
    },

    #[error("Pass {pass} could not start: {source}")]
    Start {
        pass: u32,
        #[source]
        source: PipelineError,
    },

    #[error("Pass {pass} failed: {failure}")]
    Pass {
        pass: u32,
        /// Totals of the passes that completed before the failure
        completed: LoopReport,
        #[source]
        failure: SessionFailure,
    },
}

/// Totals over all passes.
///
/// Memory stays bounded on an endless loop: only the last [`RECENT_PASSES`] reports are kept.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopReport {
    /// Finished passes
    pub passes: u32,
    /// Samples transmitted over all passes
    pub samples: u64,
    /// Sequence ranges skipped over all passes
    pub skipped: u64,
    /// Reports of the most recent passes, oldest first
    pub recent: VecDeque<SessionReport>,
    /// Stopped by cancellation rather than by the pass limit
    pub cancelled: bool,
}

impl LoopReport {
    /// Fold one finished pass into the totals.
    pub fn record(&mut self, report: SessionReport) {
        self.passes += 1;
        self.samples += report.samples();
        self.skipped += report.skipped.len() as u64;
        if self.recent.len() == RECENT_PASSES {
            self.recent.pop_front();
        }
        self.recent.push_back(report);
    }

    /// Pass number (1-based) of each kept report.
    pub fn recent_passes(&self) -> impl Iterator<Item = (u32, &SessionReport)> {
        let first = self.passes - self.recent.len() as u32 + 1;
        (first..).zip(self.recent.iter())
    }
}

/// Repeated replay of one recording.
///
/// ```rust,ignore
/// let replay = ReplayLoop::new("recordings/fm", config)
///     .loops(Some(3))
///     .delay(Duration::from_secs(1));
/// let report = replay.run(|| open_device("driver=null", Direction::Tx))?;
/// ```
#[derive(Debug)]
pub struct ReplayLoop {
    recording: PathBuf,
    config: ReplayConfig,
    loops: Option<u32>,
    delay: Duration,
    stop: Arc<StopSignal>,
}

impl ReplayLoop {
    /// A single pass with no delay.
    pub fn new(recording: impl Into<PathBuf>, config: ReplayConfig) -> Self {
        Self {
            recording: recording.into(),
            config,
            loops: Some(1),
            delay: Duration::ZERO,
            stop: Arc::new(StopSignal::new()),
        }
    }

    /// Number of passes; `None` repeats until cancelled.
    pub fn loops(mut self, loops: Option<u32>) -> Self {
        self.loops = loops;
        self
    }

    /// Pause between passes.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Signal that cancels the loop and the pass in flight.
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Cancel the loop.
    pub fn cancel(&self) {
        self.stop.stop(StopReason::Requested);
    }

    /// Run passes until the limit, a cancellation or the first failed pass.
    ///
    /// `open_device` is called once per pass because each session consumes its device.
    pub fn run<F>(&self, mut open_device: F) -> Result<LoopReport, LoopError>
    where
        F: FnMut() -> DeviceResult<Box<dyn SampleDevice>>,
    {
        let mut totals = LoopReport::default();
        let mut pass = 0u32;

        while self.loops.map_or(true, |limit| pass < limit) {
            if self.stop.is_stopped() {
                break;
            }
            pass += 1;
            let device = open_device().map_err(|source| LoopError::Device { pass, source })?;
            let handle = start_replay(&self.recording, self.config.clone(), device)
                .map_err(|source| LoopError::Start { pass, source })?;
            info!(pass, session = %handle.id(), "Replay pass started");

            while !handle.is_finished() {
                if self.stop.is_stopped() {
                    handle.cancel();
                    break;
                }
                self.stop.wait_timeout(POLL_INTERVAL);
            }

            match handle.join() {
                Ok(report) => {
                    info!(pass, samples = report.samples(), "Replay pass finished");
                    totals.record(report);
                }
                Err(failure) => {
                    warn!(pass, error = %failure.error, "Replay pass failed");
                    return Err(LoopError::Pass {
                        pass,
                        completed: totals,
                        failure,
                    });
                }
            }

            let more = self.loops.map_or(true, |limit| pass < limit);
            if more && !self.delay.is_zero() && self.stop.wait_timeout(self.delay) {
                break;
            }
        }

        totals.cancelled = self.stop.is_stopped();
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, GapPolicy};
    use crate::hardware::mock::{MemorySink, MockSource, NullSink, SinkProbe};
    use crate::session::start_capture;
    use parking_lot::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    fn record(dir: &TempDir, samples: u64) -> PathBuf {
        let base = dir.path().join("loop");
        let config = CaptureConfig::builder()
            .output(&base)
            .sample_rate(1e6)
            .buffer_samples(1000)
            .buffers_per_chunk(5)
            .queue_capacities(256, 8)
            .workers(2)
            .build()
            .unwrap();
        start_capture(config, Box::new(MockSource::ramp(samples)))
            .unwrap()
            .join()
            .unwrap();
        base
    }

    fn replay_config() -> ReplayConfig {
        ReplayConfig::builder()
            .on_gap(GapPolicy::Abort)
            .workers(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fixed_number_of_passes() {
        let dir = TempDir::new().unwrap();
        let base = record(&dir, 10_000);
        let probes: Mutex<Vec<SinkProbe>> = Mutex::new(Vec::new());

        let report = ReplayLoop::new(&base, replay_config())
            .loops(Some(3))
            .run(|| {
                let (sink, probe) = MemorySink::new();
                probes.lock().push(probe);
                Ok(Box::new(sink) as Box<dyn SampleDevice>)
            })
            .unwrap();

        assert_eq!(report.passes, 3);
        assert_eq!(report.samples, 30_000);
        assert_eq!(report.recent.len(), 3);
        assert!(!report.cancelled);
        for probe in probes.lock().iter() {
            assert_eq!(probe.samples(), MockSource::ramp_samples(0, 10_000));
        }
    }

    #[test]
    fn test_long_loop_keeps_bounded_history() {
        let dir = TempDir::new().unwrap();
        let base = record(&dir, 1_000);
        let passes = RECENT_PASSES as u32 + 4;

        let report = ReplayLoop::new(&base, replay_config())
            .loops(Some(passes))
            .run(|| Ok(Box::new(NullSink::new()) as Box<dyn SampleDevice>))
            .unwrap();

        assert_eq!(report.passes, passes);
        assert_eq!(report.samples, u64::from(passes) * 1_000);
        assert_eq!(report.recent.len(), RECENT_PASSES);
        let numbers: Vec<u32> = report.recent_passes().map(|(n, _)| n).collect();
        assert_eq!(numbers, (5..=passes).collect::<Vec<u32>>());
    }

    #[test]
    fn test_delay_between_passes() {
        let dir = TempDir::new().unwrap();
        let base = record(&dir, 1_000);
        let started = Instant::now();
        let report = ReplayLoop::new(&base, replay_config())
            .loops(Some(2))
            .delay(Duration::from_millis(100))
            .run(|| Ok(Box::new(MemorySink::new().0) as Box<dyn SampleDevice>))
            .unwrap();
        assert_eq!(report.passes, 2);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_cancel_ends_endless_loop() {
        let dir = TempDir::new().unwrap();
        let base = record(&dir, 5_000);
        let replay = ReplayLoop::new(&base, replay_config())
            .loops(None)
            .delay(Duration::from_millis(10));
        let stop = replay.stop_signal();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            stop.stop(StopReason::Requested);
        });

        let report = replay
            .run(|| Ok(Box::new(MemorySink::new().0) as Box<dyn SampleDevice>))
            .unwrap();
        canceller.join().unwrap();
        assert!(report.cancelled);
        assert!(report.passes > 0);
    }
}
