//! Chunk file and binary index.
//!
//! A session with base path `B` is stored as three files:
//!
//! - `B.dat`: compressed chunk payloads, concatenated in sequence order
//! - `B.idx`: the authoritative index, one fixed-size record per chunk
//! - `B.meta`: session metadata (see [`metadata`](crate::data::metadata))
//!
//! # Index layout (little-endian)
//!
//! ```text
//! header  (16 bytes)  magic "RFIDX001" | u32 version = 1 | u32 reserved
//! record  (72 bytes)  u64 sequence_start | u64 sequence_end | u64 sample_count
//!                     u64 byte_offset | u64 byte_length | [u8; 32] sha256(payload)
//! ```
//!
//! The writer only ever appends. An index record is written after its payload has been handed
//! to the OS, so after a crash the index may be shorter than the data file but never points
//! past it. On open, a trailing partial record or a record whose payload is not fully present
//! in `B.dat` is ignored.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{Chunk, SequenceRange};
use crate::data::codec::checksum;
use crate::error::{PipelineError, StorageError};

/// Index file magic.
pub const INDEX_MAGIC: &[u8; 8] = b"RFIDX001";
/// Index format version.
pub const INDEX_VERSION: u32 = 1;
/// Index header size in bytes.
pub const INDEX_HEADER_LEN: usize = 16;
/// Index record size in bytes.
pub const INDEX_RECORD_LEN: usize = 72;

/// File paths derived from a session base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Base path without extension
    pub base: PathBuf,
    /// Chunk payloads
    pub data: PathBuf,
    /// Binary index
    pub index: PathBuf,
    /// Session metadata
    pub meta: PathBuf,
}

impl SessionPaths {
    /// Derive paths by appending `.dat`, `.idx` and `.meta` to `base`.
    ///
    /// A `base` that already ends in one of those extensions is stripped first, so either the
    /// base or any of the three files can be named.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let mut base = base.as_ref().to_path_buf();
        if matches!(
            base.extension().and_then(|e| e.to_str()),
            Some("dat" | "idx" | "meta")
        ) {
            base.set_extension("");
        }
        let with = |ext: &str| {
            let mut name = OsString::from(base.as_os_str());
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        };
        Self {
            data: with("dat"),
            index: with("idx"),
            meta: with("meta"),
            base,
        }
    }
}

/// One index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexRecord {
    /// Buffer sequence numbers covered
    pub range: SequenceRange,
    /// Complex samples after decompression
    pub sample_count: u64,
    /// Payload offset in the data file
    pub byte_offset: u64,
    /// Payload length in bytes
    pub byte_length: u64,
    /// SHA-256 of the payload
    #[serde(skip)]
    pub checksum: [u8; 32],
}

impl IndexRecord {
    /// Encode as a 72-byte little-endian record.
    pub fn to_bytes(&self) -> [u8; INDEX_RECORD_LEN] {
        let mut out = [0u8; INDEX_RECORD_LEN];
        out[0..8].copy_from_slice(&self.range.start.to_le_bytes());
        out[8..16].copy_from_slice(&self.range.end.to_le_bytes());
        out[16..24].copy_from_slice(&self.sample_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.byte_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.byte_length.to_le_bytes());
        out[40..72].copy_from_slice(&self.checksum);
        out
    }

    /// Decode a record. `None` if the sequence range is inverted.
    pub fn from_bytes(bytes: &[u8; INDEX_RECORD_LEN]) -> Option<Self> {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let (start, end) = (word(0), word(8));
        if start > end {
            return None;
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[40..72]);
        Some(Self {
            range: SequenceRange { start, end },
            sample_count: word(16),
            byte_offset: word(24),
            byte_length: word(32),
            checksum,
        })
    }

    /// First byte past the payload.
    pub fn payload_end(&self) -> u64 {
        self.byte_offset.saturating_add(self.byte_length)
    }
}

/// Totals returned when a writer is finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterSummary {
    /// Chunks persisted
    pub chunks: u64,
    /// Complex samples persisted
    pub samples: u64,
    /// Bytes before compression
    pub original_bytes: u64,
    /// Bytes in the data file
    pub compressed_bytes: u64,
    /// Last persisted sequence range
    pub last_range: Option<SequenceRange>,
}

// =============================================================================
// ChunkWriter
// =============================================================================

/// Sequential, append-only chunk persistence.
pub struct ChunkWriter {
    paths: SessionPaths,
    data: BufWriter<File>,
    index: BufWriter<File>,
    offset: u64,
    summary: WriterSummary,
}

impl ChunkWriter {
    /// Create (truncating) the data and index files and write the index header.
    pub fn create(paths: SessionPaths) -> Result<Self, StorageError> {
        if let Some(parent) = paths.base.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|e| StorageError::io(path, e))
        };
        let data = BufWriter::with_capacity(1024 * 1024, open(&paths.data)?);
        let mut index = BufWriter::new(open(&paths.index)?);

        let mut header = [0u8; INDEX_HEADER_LEN];
        header[0..8].copy_from_slice(INDEX_MAGIC);
        header[8..12].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        index
            .write_all(&header)
            .map_err(|e| StorageError::io(&paths.index, e))?;

        info!(data = %paths.data.display(), "Chunk writer created");
        Ok(Self {
            paths,
            data,
            index,
            offset: 0,
            summary: WriterSummary::default(),
        })
    }

    /// Append one chunk. Chunks must arrive in strictly increasing sequence order.
    pub fn append(&mut self, chunk: &Chunk) -> Result<IndexRecord, StorageError> {
        if let Some(last) = self.summary.last_range {
            if chunk.range.start <= last.end {
                return Err(StorageError::OutOfOrder {
                    range: chunk.range,
                    last: last.end,
                });
            }
        }

        self.data
            .write_all(&chunk.payload)
            .and_then(|()| self.data.flush())
            .map_err(|e| StorageError::io(&self.paths.data, e))?;

        let record = IndexRecord {
            range: chunk.range,
            sample_count: chunk.sample_count,
            byte_offset: self.offset,
            byte_length: chunk.payload.len() as u64,
            checksum: chunk.checksum,
        };
        self.index
            .write_all(&record.to_bytes())
            .map_err(|e| StorageError::io(&self.paths.index, e))?;

        self.offset += record.byte_length;
        self.summary.chunks += 1;
        self.summary.samples += chunk.sample_count;
        self.summary.original_bytes += chunk.sample_count * crate::core::BYTES_PER_SAMPLE as u64;
        self.summary.compressed_bytes += record.byte_length;
        self.summary.last_range = Some(chunk.range);
        debug!(
            ordinal = chunk.ordinal,
            range = %chunk.range,
            bytes = record.byte_length,
            "Chunk persisted"
        );
        Ok(record)
    }

    /// Totals so far.
    pub fn summary(&self) -> &WriterSummary {
        &self.summary
    }

    /// Session paths.
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Flush and fsync both files.
    pub fn finish(mut self) -> Result<WriterSummary, StorageError> {
        self.data
            .flush()
            .and_then(|()| self.data.get_ref().sync_all())
            .map_err(|e| StorageError::io(&self.paths.data, e))?;
        self.index
            .flush()
            .and_then(|()| self.index.get_ref().sync_all())
            .map_err(|e| StorageError::io(&self.paths.index, e))?;
        info!(
            chunks = self.summary.chunks,
            samples = self.summary.samples,
            bytes = self.summary.compressed_bytes,
            "Chunk writer finished"
        );
        Ok(self.summary)
    }
}

// =============================================================================
// ChunkReader
// =============================================================================

/// One step of a replay plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// Read this chunk
    Chunk(IndexRecord),
    /// Nothing is stored for this range
    Gap(SequenceRange),
}

/// Result of [`ChunkReader::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Chunks checked
    pub chunks: u64,
    /// Samples covered by chunks that verified
    pub valid_samples: u64,
    /// Ranges whose payload failed its checksum
    pub corrupt: Vec<SequenceRange>,
    /// Holes between consecutive chunks
    pub gaps: Vec<SequenceRange>,
}

impl VerifyReport {
    /// True when no chunk failed verification.
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Ordered access to a persisted session.
pub struct ChunkReader {
    paths: SessionPaths,
    data: File,
    records: Vec<IndexRecord>,
}

impl ChunkReader {
    /// Open a session and load its index.
    pub fn open(paths: SessionPaths) -> Result<Self, StorageError> {
        let mut raw = Vec::new();
        File::open(&paths.index)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| StorageError::io(&paths.index, e))?;
        let data = File::open(&paths.data).map_err(|e| StorageError::io(&paths.data, e))?;
        let data_len = data
            .metadata()
            .map_err(|e| StorageError::io(&paths.data, e))?
            .len();

        let corrupt = |message: String| StorageError::CorruptIndex {
            path: paths.index.clone(),
            message,
        };
        if raw.len() < INDEX_HEADER_LEN || &raw[0..8] != INDEX_MAGIC {
            return Err(corrupt("missing RFIDX001 header".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&raw[8..12]);
        let version = u32::from_le_bytes(version);
        if version != INDEX_VERSION {
            return Err(corrupt(format!("unsupported index version {version}")));
        }

        let body = &raw[INDEX_HEADER_LEN..];
        let partial = body.len() % INDEX_RECORD_LEN;
        if partial != 0 {
            warn!(
                index = %paths.index.display(),
                bytes = partial,
                "Ignoring trailing partial index record"
            );
        }

        let mut records: Vec<IndexRecord> = Vec::with_capacity(body.len() / INDEX_RECORD_LEN);
        for (i, bytes) in body.chunks_exact(INDEX_RECORD_LEN).enumerate() {
            let mut fixed = [0u8; INDEX_RECORD_LEN];
            fixed.copy_from_slice(bytes);
            let record = IndexRecord::from_bytes(&fixed)
                .ok_or_else(|| corrupt(format!("record {i} has an inverted sequence range")))?;
            if record.payload_end() > data_len {
                warn!(
                    index = %paths.index.display(),
                    record = i,
                    range = %record.range,
                    "Ignoring index records whose payload is not fully present in the data file"
                );
                break;
            }
            if let Some(prev) = records.last() {
                if record.range.start <= prev.range.end {
                    return Err(corrupt(format!(
                        "record {i} ({}) does not follow {}",
                        record.range, prev.range
                    )));
                }
            }
            records.push(record);
        }

        debug!(index = %paths.index.display(), chunks = records.len(), "Index loaded");
        Ok(Self {
            paths,
            data,
            records,
        })
    }

    /// Valid index records in sequence order.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Session paths.
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Samples covered by the index.
    pub fn total_samples(&self) -> u64 {
        self.records.iter().map(|r| r.sample_count).sum()
    }

    /// First to last stored sequence number.
    pub fn sequence_span(&self) -> Option<SequenceRange> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some(SequenceRange::new(first.range.start, last.range.end))
    }

    /// Read a chunk's payload from the data file.
    pub fn read_payload(&mut self, record: &IndexRecord) -> Result<Vec<u8>, StorageError> {
        let mut payload = vec![0u8; record.byte_length as usize];
        self.data
            .seek(SeekFrom::Start(record.byte_offset))
            .and_then(|_| self.data.read_exact(&mut payload))
            .map_err(|e| StorageError::io(&self.paths.data, e))?;
        Ok(payload)
    }

    /// Records covering `range` (the whole session if `None`), with holes reported as gaps.
    pub fn plan_with_gaps(&self, range: Option<SequenceRange>) -> Vec<PlanStep> {
        let Some(span) = self.sequence_span() else {
            return range.map(PlanStep::Gap).into_iter().collect();
        };
        let requested = range.unwrap_or(span);
        if requested.start > span.end {
            return vec![PlanStep::Gap(requested)];
        }
        // An open-ended request stops at the last recorded sequence.
        let range = SequenceRange::new(requested.start, requested.end.min(span.end));
        let mut steps = Vec::new();
        let mut expected = range.start;
        for record in self.records.iter().filter(|r| r.range.overlaps(&range)) {
            if record.range.start > expected {
                steps.push(PlanStep::Gap(SequenceRange::new(
                    expected,
                    record.range.start - 1,
                )));
            }
            steps.push(PlanStep::Chunk(*record));
            expected = record.range.end.saturating_add(1);
        }
        if expected <= range.end {
            steps.push(PlanStep::Gap(SequenceRange::new(expected, range.end)));
        }
        steps
    }

    /// Records covering `range` in order, failing on the first hole.
    pub fn plan(&self, range: Option<SequenceRange>) -> Result<Vec<IndexRecord>, PipelineError> {
        self.plan_with_gaps(range)
            .into_iter()
            .map(|step| match step {
                PlanStep::Chunk(record) => Ok(record),
                PlanStep::Gap(missing) => Err(PipelineError::Gap { missing }),
            })
            .collect()
    }

    /// Re-hash every payload and list holes.
    pub fn verify(&mut self) -> Result<VerifyReport, StorageError> {
        let mut report = VerifyReport::default();
        for step in self.plan_with_gaps(None) {
            match step {
                PlanStep::Gap(range) => report.gaps.push(range),
                PlanStep::Chunk(record) => {
                    report.chunks += 1;
                    if checksum(&self.read_payload(&record)?) == record.checksum {
                        report.valid_samples += record.sample_count;
                    } else {
                        warn!(range = %record.range, "Chunk checksum mismatch");
                        report.corrupt.push(record.range);
                    }
                }
            }
        }
        Ok(report)
    }
}
