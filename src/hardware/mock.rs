//! Mock Hardware Implementations
//!
//! Simulated front ends for running full sessions without a radio attached.
//!
//! # Available Mocks
//!
//! - `MockSource` - Synthetic capture source (tone + noise, or a deterministic ramp) with
//!   optional real-time pacing, overrun injection and fault injection
//! - `MemorySink` - Non-blocking replay harness that records everything written to it
//! - `NullSink` - Replay sink that discards samples

use std::f64::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use num_complex::Complex32;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::SampleBuffer;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{
    Direction, ReadOutcome, SampleDevice, StreamParams, WriteOutcome,
};

// =============================================================================
// MockSource - Synthetic capture source
// =============================================================================

/// Signal produced by [`MockSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    /// Complex tone at `tone_offset_hz` plus uniform noise
    #[default]
    Tone,
    /// Deterministic counter pattern, see [`MockSource::ramp_sample`]
    Ramp,
}

/// Configuration for [`MockSource`].
#[derive(Debug, Clone)]
pub struct MockSourceConfig {
    /// Signal shape
    pub waveform: Waveform,
    /// Tone offset from center frequency in Hz
    pub tone_offset_hz: f64,
    /// Tone amplitude as a fraction of full scale
    pub amplitude: f32,
    /// Noise amplitude as a fraction of full scale
    pub noise: f32,
    /// RNG seed for the noise
    pub seed: u64,
    /// Block each read until the samples would have arrived in real time
    pub paced: bool,
    /// Stop with `EndOfStream` after this many samples
    pub total_samples: Option<u64>,
    /// Report an overrun on every Nth read
    pub overrun_every: Option<u64>,
    /// Fail with `ConnectionLost` once this many reads have succeeded
    pub fail_after_reads: Option<u64>,
    /// Return only half the requested samples on every Nth read
    pub short_read_every: Option<u64>,
}

impl Default for MockSourceConfig {
    fn default() -> Self {
        Self {
            waveform: Waveform::Tone,
            tone_offset_hz: 100e3,
            amplitude: 0.5,
            noise: 0.01,
            seed: 0,
            paced: false,
            total_samples: None,
            overrun_every: None,
            fail_after_reads: None,
            short_read_every: None,
        }
    }
}

/// Synthetic receive-only device.
///
/// # Example
///
/// ```rust,ignore
/// let mut source = MockSource::new(MockSourceConfig {
///     waveform: Waveform::Ramp,
///     total_samples: Some(65_536),
///     ..Default::default()
/// });
/// source.start_streaming(&params)?;
/// let outcome = source.read_buffer(8192)?;
/// ```
pub struct MockSource {
    config: MockSourceConfig,
    params: Option<StreamParams>,
    rng: StdRng,
    /// Stream position in samples, including samples lost to overruns
    position: u64,
    reads: u64,
    started_at: Option<Instant>,
}

impl MockSource {
    /// Create a source; nothing is generated until `start_streaming`.
    pub fn new(config: MockSourceConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            params: None,
            rng,
            position: 0,
            reads: 0,
            started_at: None,
        }
    }

    /// Finite ramp source, the usual fixture for fidelity tests.
    pub fn ramp(total_samples: u64) -> Self {
        Self::new(MockSourceConfig {
            waveform: Waveform::Ramp,
            total_samples: Some(total_samples),
            ..Default::default()
        })
    }

    /// The I/Q pair a ramp source emits at stream position `index`.
    pub fn ramp_sample(index: u64) -> (i16, i16) {
        ((index & 0x7FFF) as i16, ((index >> 15) & 0x7FFF) as i16)
    }

    /// Interleaved ramp samples for positions `start..start + count`.
    pub fn ramp_samples(start: u64, count: u64) -> Vec<i16> {
        let mut out = Vec::with_capacity(count as usize * 2);
        for index in start..start + count {
            let (i, q) = Self::ramp_sample(index);
            out.push(i);
            out.push(q);
        }
        out
    }

    fn generate(&mut self, count: usize, sample_rate: f64) -> Vec<i16> {
        match self.config.waveform {
            Waveform::Ramp => Self::ramp_samples(self.position, count as u64),
            Waveform::Tone => {
                let step = TAU * self.config.tone_offset_hz / sample_rate;
                let mut out = Vec::with_capacity(count * 2);
                for k in 0..count as u64 {
                    let phase = ((self.position + k) as f64 * step) % TAU;
                    let tone = Complex32::from_polar(self.config.amplitude, phase as f32);
                    let noise = Complex32::new(
                        self.rng.gen_range(-1.0f32..=1.0) * self.config.noise,
                        self.rng.gen_range(-1.0f32..=1.0) * self.config.noise,
                    );
                    let s = tone + noise;
                    out.push(to_sc16(s.re));
                    out.push(to_sc16(s.im));
                }
                out
            }
        }
    }
}

fn to_sc16(x: f32) -> i16 {
    (x * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

impl SampleDevice for MockSource {
    fn describe(&self) -> String {
        format!("mock source ({:?}, seed {})", self.config.waveform, self.config.seed)
    }

    fn start_streaming(&mut self, params: &StreamParams) -> DeviceResult<StreamParams> {
        params.validate()?;
        if params.direction != Direction::Rx {
            return Err(DeviceError::NotSupported {
                message: "mock source is receive-only".to_string(),
            });
        }
        self.params = Some(params.clone());
        self.started_at = Some(Instant::now());
        info!(
            sample_rate = params.sample_rate_hz,
            center_frequency = params.center_frequency_hz,
            paced = self.config.paced,
            "Mock source streaming"
        );
        Ok(params.clone())
    }

    fn read_buffer(&mut self, capacity: usize) -> DeviceResult<ReadOutcome> {
        let (sample_rate, started_at) = match (&self.params, self.started_at) {
            (Some(p), Some(t)) => (p.sample_rate_hz, t),
            _ => {
                return Err(DeviceError::NotStreaming {
                    message: "read_buffer before start_streaming".to_string(),
                })
            }
        };

        if let Some(limit) = self.config.fail_after_reads {
            if self.reads >= limit {
                return Err(DeviceError::ConnectionLost {
                    message: format!("mock source failed after {limit} reads"),
                });
            }
        }
        self.reads += 1;

        let remaining = match self.config.total_samples {
            Some(total) => total.saturating_sub(self.position),
            None => u64::MAX,
        };
        if remaining == 0 {
            return Ok(ReadOutcome::EndOfStream);
        }
        let mut count = (capacity as u64).min(remaining) as usize;
        if let Some(every) = self.config.short_read_every {
            if every > 0 && self.reads % every == 0 && count > 1 {
                count /= 2;
            }
        }

        if let Some(every) = self.config.overrun_every {
            if every > 0 && self.reads % every == 0 {
                // The hardware kept sampling while nobody was reading.
                self.position += count as u64;
                return Ok(ReadOutcome::Overrun);
            }
        }

        let samples = self.generate(count, sample_rate);
        self.position += count as u64;

        if self.config.paced {
            let due = started_at + Duration::from_secs_f64(self.position as f64 / sample_rate);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        Ok(ReadOutcome::Samples(samples))
    }

    fn stop(&mut self) -> DeviceResult<()> {
        if self.params.take().is_some() {
            debug!(samples = self.position, reads = self.reads, "Mock source stopped");
        }
        Ok(())
    }

    fn paces_output(&self) -> bool {
        false
    }
}

// =============================================================================
// MemorySink - In-memory replay harness
// =============================================================================

/// Everything a [`MemorySink`] has observed.
#[derive(Debug, Default)]
pub struct SinkRecord {
    /// Interleaved samples in write order
    pub samples: Vec<i16>,
    /// Sequence number of every buffer written
    pub sequences: Vec<u64>,
    /// Underruns reported to the transmitter
    pub underruns: u64,
    /// Number of `flush` calls
    pub flushes: u64,
    /// Whether `stop` was called
    pub stopped: bool,
    /// Time of the first write
    pub first_write: Option<Instant>,
    /// Time of the most recent write
    pub last_write: Option<Instant>,
}

/// Shared view into a [`MemorySink`], usable after the sink itself has been dropped.
#[derive(Debug, Clone, Default)]
pub struct SinkProbe {
    inner: Arc<Mutex<SinkRecord>>,
}

impl SinkProbe {
    /// Copy of every sample written so far.
    pub fn samples(&self) -> Vec<i16> {
        self.inner.lock().samples.clone()
    }

    /// Sequence numbers of every buffer written so far.
    pub fn sequences(&self) -> Vec<u64> {
        self.inner.lock().sequences.clone()
    }

    /// Complex samples written so far.
    pub fn sample_count(&self) -> u64 {
        (self.inner.lock().samples.len() / 2) as u64
    }

    /// Elapsed time between the first and last write.
    pub fn write_span(&self) -> Option<Duration> {
        let record = self.inner.lock();
        Some(record.last_write?.duration_since(record.first_write?))
    }

    /// Whether the sink has been stopped (handle released).
    pub fn stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Number of flushes seen.
    pub fn flushes(&self) -> u64 {
        self.inner.lock().flushes
    }
}

/// Non-blocking transmit device that records what it is given.
pub struct MemorySink {
    probe: SinkProbe,
    underrun_every: Option<u64>,
    streaming: bool,
    writes: u64,
}

impl MemorySink {
    /// Create a sink and the probe used to inspect it.
    pub fn new() -> (Self, SinkProbe) {
        let probe = SinkProbe::default();
        (
            Self {
                probe: probe.clone(),
                underrun_every: None,
                streaming: false,
                writes: 0,
            },
            probe,
        )
    }

    /// Report an underrun on every Nth write.
    pub fn with_underrun_every(mut self, every: u64) -> Self {
        self.underrun_every = Some(every);
        self
    }
}

impl SampleDevice for MemorySink {
    fn describe(&self) -> String {
        "memory sink".to_string()
    }

    fn start_streaming(&mut self, params: &StreamParams) -> DeviceResult<StreamParams> {
        params.validate()?;
        if params.direction != Direction::Tx {
            return Err(DeviceError::NotSupported {
                message: "memory sink is transmit-only".to_string(),
            });
        }
        self.streaming = true;
        Ok(params.clone())
    }

    fn write_buffer(&mut self, buffer: &SampleBuffer) -> DeviceResult<WriteOutcome> {
        if !self.streaming {
            return Err(DeviceError::NotStreaming {
                message: "write_buffer before start_streaming".to_string(),
            });
        }
        self.writes += 1;
        let underrun = matches!(self.underrun_every, Some(n) if n > 0 && self.writes % n == 0);

        let now = Instant::now();
        let mut record = self.probe.inner.lock();
        record.samples.extend_from_slice(&buffer.samples);
        record.sequences.push(buffer.sequence);
        record.first_write.get_or_insert(now);
        record.last_write = Some(now);
        if underrun {
            record.underruns += 1;
            return Ok(WriteOutcome::Underrun);
        }
        Ok(WriteOutcome::Sent)
    }

    fn flush(&mut self) -> DeviceResult<()> {
        self.probe.inner.lock().flushes += 1;
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.streaming = false;
        self.probe.inner.lock().stopped = true;
        Ok(())
    }

    fn paces_output(&self) -> bool {
        false
    }
}

// =============================================================================
// NullSink - Discarding replay sink
// =============================================================================

/// Transmit device that drops every sample.
#[derive(Debug, Default)]
pub struct NullSink {
    samples: u64,
    streaming: bool,
}

impl NullSink {
    /// Create a new null sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleDevice for NullSink {
    fn describe(&self) -> String {
        "null sink".to_string()
    }

    fn start_streaming(&mut self, params: &StreamParams) -> DeviceResult<StreamParams> {
        params.validate()?;
        self.streaming = true;
        Ok(params.clone())
    }

    fn write_buffer(&mut self, buffer: &SampleBuffer) -> DeviceResult<WriteOutcome> {
        if !self.streaming {
            return Err(DeviceError::NotStreaming {
                message: "write_buffer before start_streaming".to_string(),
            });
        }
        self.samples += buffer.len() as u64;
        Ok(WriteOutcome::Sent)
    }

    fn stop(&mut self) -> DeviceResult<()> {
        if self.streaming {
            debug!(samples = self.samples, "Null sink stopped");
        }
        self.streaming = false;
        Ok(())
    }

    fn paces_output(&self) -> bool {
        false
    }
}
