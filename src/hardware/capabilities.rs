//! Sample Device Capability
//!
//! The pipeline never depends on a concrete radio driver. Everything it needs from the
//! front end is expressed by the [`SampleDevice`] trait: configure and start a stream,
//! move fixed-size blocks of `sc16` samples in one direction, and stop.
//!
//! # Design Philosophy
//!
//! - Synchronous: the device is driven by one dedicated OS thread per session, so the
//!   blocking calls map directly onto the hardware's own timing.
//! - `Send` but not `Sync`: ownership of the handle moves into the acquisition or
//!   transmission thread and nothing else touches it.
//! - Overruns and underruns are *outcomes*, not errors. Only [`DeviceError`] aborts a session.
//!
//! # Implementations
//!
//! - [`MockSource`](crate::hardware::mock::MockSource): synthetic capture source
//! - [`MemorySink`](crate::hardware::mock::MemorySink): in-memory replay harness
//! - [`NullSink`](crate::hardware::mock::NullSink): discarding replay sink
//! - [`FileDevice`](crate::hardware::file::FileDevice): raw `sc16` file in or out

use serde::{Deserialize, Serialize};

use crate::core::SampleBuffer;
use crate::error::{DeviceError, DeviceResult};

/// Streaming direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Receive (capture)
    Rx,
    /// Transmit (replay)
    Tx,
}

/// Parameters requested from, and reported back by, a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Streaming direction
    pub direction: Direction,
    /// Sample rate in Hz
    pub sample_rate_hz: f64,
    /// Center frequency in Hz
    pub center_frequency_hz: f64,
    /// RF gain in dB
    pub gain_db: f64,
    /// Complex samples per device buffer
    pub buffer_samples: usize,
}

impl StreamParams {
    /// Check the parameters are physically meaningful.
    pub fn validate(&self) -> DeviceResult<()> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(DeviceError::InvalidConfig {
                message: format!("Invalid sample rate: {}", self.sample_rate_hz),
            });
        }
        if !(self.center_frequency_hz.is_finite() && self.center_frequency_hz >= 0.0) {
            return Err(DeviceError::InvalidConfig {
                message: format!("Invalid center frequency: {}", self.center_frequency_hz),
            });
        }
        if self.buffer_samples == 0 {
            return Err(DeviceError::InvalidConfig {
                message: "Buffer size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Nominal duration of one device buffer in seconds.
    pub fn buffer_period_secs(&self) -> f64 {
        self.buffer_samples as f64 / self.sample_rate_hz
    }
}

/// Result of a capture read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Interleaved I/Q samples (at most the requested capacity)
    Samples(Vec<i16>),
    /// The device lost samples because the host did not read in time
    Overrun,
    /// No samples arrived within the receive timeout
    Timeout,
    /// A finite source has no more samples
    EndOfStream,
}

/// Result of a replay write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Buffer accepted
    Sent,
    /// The device ran dry before this buffer arrived; the buffer itself was accepted
    Underrun,
}

/// Capability: streaming sample I/O.
///
/// # Contract
/// - `start_streaming` must be called once before any read or write, and returns the
///   values the hardware actually applied (rates are frequently rounded).
/// - `read_buffer` / `write_buffer` are the only calls allowed to block on hardware timing.
/// - `stop` is idempotent and releases the stream; the handle is dropped afterwards.
pub trait SampleDevice: Send {
    /// Short human-readable description (driver and key arguments).
    fn describe(&self) -> String;

    /// Configure and start streaming in `params.direction`.
    fn start_streaming(&mut self, params: &StreamParams) -> DeviceResult<StreamParams>;

    /// Read up to `capacity` complex samples.
    ///
    /// # Errors
    /// Returns `NotSupported` on transmit-only devices.
    fn read_buffer(&mut self, capacity: usize) -> DeviceResult<ReadOutcome> {
        let _ = capacity;
        Err(DeviceError::NotSupported {
            message: format!("{} cannot receive", self.describe()),
        })
    }

    /// Write one buffer of samples.
    ///
    /// # Errors
    /// Returns `NotSupported` on receive-only devices.
    fn write_buffer(&mut self, buffer: &SampleBuffer) -> DeviceResult<WriteOutcome> {
        let _ = buffer;
        Err(DeviceError::NotSupported {
            message: format!("{} cannot transmit", self.describe()),
        })
    }

    /// Push out anything buffered inside the device (end of burst).
    fn flush(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Stop streaming.
    fn stop(&mut self) -> DeviceResult<()>;

    /// Whether `write_buffer` blocks at the hardware sample clock.
    ///
    /// When false the transmitter paces writes itself.
    fn paces_output(&self) -> bool;
}
