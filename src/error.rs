//! Error types for the capture and replay pipelines.
//!
//! The taxonomy mirrors how each failure is handled by a session:
//!
//! - **`DeviceError`**: fatal. Connection lost or invalid configuration; the session aborts
//!   immediately. Overruns and underruns are *not* errors, they are reported through
//!   [`ReadOutcome`](crate::hardware::ReadOutcome) / [`WriteOutcome`](crate::hardware::WriteOutcome)
//!   and accounted by the overflow monitor.
//! - **`StorageError`**: fatal. Disk full, write failure, or an unreadable index. Triggers the
//!   clean-shutdown path.
//! - **`PipelineError`**: the session-level error. Wraps the two above and adds compression
//!   failures, checksum mismatches, gaps in a replayed sequence range, degraded-mode aborts and
//!   configuration problems.
//!
//! Hardware and storage failures are never retried inside the core.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::SequenceRange;

/// Convenience alias for results using the pipeline error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors reported by a [`SampleDevice`](crate::hardware::SampleDevice).
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No driver matches the connection string
    #[error("No device matches '{args}'")]
    NotFound { args: String },

    /// The requested stream parameters are not usable
    #[error("Invalid device configuration: {message}")]
    InvalidConfig { message: String },

    /// The device disappeared or stopped responding
    #[error("Device connection lost: {message}")]
    ConnectionLost { message: String },

    /// Operation issued in the wrong streaming state (e.g. read before start)
    #[error("Device not streaming: {message}")]
    NotStreaming { message: String },

    /// Operation not supported by this device variant
    #[error("Operation not supported: {message}")]
    NotSupported { message: String },

    /// I/O error from a file-backed device
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from chunk files, index files and metadata records.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O failure on a session file
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The index header or a record is malformed
    #[error("Corrupt index '{path}': {message}")]
    CorruptIndex { path: PathBuf, message: String },

    /// The session metadata record could not be parsed
    #[error("Invalid session metadata '{path}': {message}")]
    Metadata { path: PathBuf, message: String },

    /// Chunks were appended out of sequence order
    #[error("Chunk {range} does not follow previously written sequence {last}")]
    OutOfOrder { range: SequenceRange, last: u64 },
}

impl StorageError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that terminate (or, for gaps under `GapPolicy::Skip`, are reported by) a session.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Compression error in chunk {ordinal}: {message}")]
    Compression { ordinal: u64, message: String },

    #[error("Checksum mismatch for sequence {range}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        range: SequenceRange,
        expected: String,
        actual: String,
    },

    #[error("Sequence range {missing} is missing from the index")]
    Gap { missing: SequenceRange },

    #[error("Pipeline degraded: {events} overflow events within {window_ms} ms")]
    Degraded { events: u64, window_ms: u64 },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline thread '{0}' panicked")]
    ThreadPanicked(String),
}

impl PipelineError {
    /// Whether this error was caused by missing or corrupt persisted data.
    pub fn is_data_integrity(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Gap { .. })
    }

    /// Whether the error is confined to a single chunk, so replay can skip past it.
    pub fn is_chunk_local(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Compression { .. } | Self::Gap { .. }
        )
    }
}
