//! # RF Recorder Core Library
//!
//! Lossless real-time capture of complex baseband (IQ) samples from a software-defined radio
//! to compressed, checksummed chunk files, and timing-accurate replay of those files back to
//! a transmitter. The binary (`main.rs`) is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`core`**: Sample buffers, chunks and sequence ranges shared by every stage.
//! - **`hardware`**: The `SampleDevice` trait plus mock, memory, null and file devices and the
//!   connection-string registry.
//! - **`pipeline`**: Bounded queues with overflow policies, the reorder window, compression and
//!   decompression worker pools, the overflow monitor and the paced transmitter.
//! - **`data`**: Codecs and checksums, the chunk file format (`.dat` + `.idx`) and session
//!   metadata (`.meta`).
//! - **`session`**: Capture and replay session lifecycles (`start_capture`, `start_replay`,
//!   `SessionHandle`).
//! - **`controller`**: Compositions of sessions, such as looping replay.
//! - **`config`**: figment-layered file/environment configuration and the runtime
//!   `CaptureConfig` / `ReplayConfig` builders.
//! - **`error`**: `DeviceError`, `StorageError` and the session-level `PipelineError`.
//! - **`logging`**: tracing subscriber initialisation.

pub mod config;
pub mod controller;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod pipeline;
pub mod session;

pub use error::{DeviceError, PipelineError, Result, StorageError};
pub use session::{start_capture, start_replay, SessionFailure, SessionHandle, SessionReport};
