//! Streaming pipeline primitives.
//!
//! ```text
//! capture: device ─▶ queue(raw, drop-oldest) ─▶ CompressionStage ─▶ Sequencer
//!                ─▶ queue(compressed, block) ─▶ ChunkWriter
//! replay:  ChunkReader ─▶ queue(compressed, block) ─▶ DecompressionStage ─▶ Sequencer
//!                ─▶ queue(raw, block) ─▶ PacedTransmitter ─▶ device
//! ```
//!
//! Every queue and stage registers its counters with one [`OverflowMonitor`] per session.

pub mod monitor;
pub mod queue;
pub mod reorder;
pub mod stop;
pub mod transmitter;
pub mod workers;

pub use monitor::{
    DegradedThreshold, OverflowKind, OverflowMonitor, PipelineStats, QueueStats, StageStats,
};
pub use queue::{BoundedSampleQueue, OverflowPolicy, PopTimeout, QueueClosed, Run};
pub use reorder::{ProducerGuard, ReorderError, ReorderWindow, Sequencer};
pub use stop::{StopReason, StopSignal};
pub use transmitter::{PacedTransmitter, Pacer, TransmitState, TransmitSummary};
pub use workers::{CompressionStage, DecodeOptions, DecompressionStage, StoredChunk, WorkerPool};
