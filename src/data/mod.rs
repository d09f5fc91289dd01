//! Persistence layer.
//!
//! - `codec`: chunk compression and checksums
//! - `chunk_file`: append-only data file plus binary index
//! - `metadata`: the per-session `key=value` record

pub mod chunk_file;
pub mod codec;
pub mod metadata;

pub use chunk_file::{
    ChunkReader, ChunkWriter, IndexRecord, PlanStep, SessionPaths, VerifyReport, WriterSummary,
};
pub use codec::{checksum, checksum_hex, Codec, Compression};
pub use metadata::{Finalization, SessionMetadata, SessionStatus};
