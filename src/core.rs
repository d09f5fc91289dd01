//! Core data model shared by every pipeline stage.
//!
//! - [`SampleBuffer`]: one fixed-length block of interleaved I/Q samples assembled from device
//!   reads, or written to the device. Only the last buffer of a session may be short. Tagged
//!   with a sequence number and capture timestamp.
//! - [`RawChunk`]: a contiguous run of buffers taken off the raw queue by a compression worker.
//! - [`Chunk`]: the compressed on-disk unit covering a [`SequenceRange`].
//!
//! Ownership moves with the data: a buffer is owned by exactly one stage at a time and is never
//! mutated after leaving the stage that produced it.

use std::fmt;

use chrono::{DateTime, Utc};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Bytes per complex `sc16` sample (two little-endian `i16`).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Inclusive range of buffer sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRange {
    /// First sequence number in the range
    pub start: u64,
    /// Last sequence number in the range (inclusive)
    pub end: u64,
}

impl SequenceRange {
    /// Create a range; `end` is inclusive.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted sequence range {start}..={end}");
        Self { start, end }
    }

    /// Range covering a single sequence number.
    pub fn single(sequence: u64) -> Self {
        Self::new(sequence, sequence)
    }

    /// Number of sequence numbers covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a range covers at least one sequence number.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `sequence` falls inside this range.
    pub fn contains(&self, sequence: u64) -> bool {
        (self.start..=self.end).contains(&sequence)
    }

    /// Whether `self` starts exactly one past the end of `previous`.
    pub fn follows(&self, previous: &SequenceRange) -> bool {
        previous.end.checked_add(1) == Some(self.start)
    }

    /// Whether the two ranges share at least one sequence number.
    pub fn overlaps(&self, other: &SequenceRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A block of interleaved `sc16` I/Q samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    /// Position of this buffer in the session stream
    pub sequence: u64,
    /// Wall-clock time the buffer was acquired (or decoded, on replay)
    pub timestamp: DateTime<Utc>,
    /// Interleaved I, Q, I, Q, ...
    pub samples: Vec<i16>,
}

impl SampleBuffer {
    /// Create a buffer stamped with the current time.
    pub fn new(sequence: u64, samples: Vec<i16>) -> Self {
        debug_assert!(samples.len() % 2 == 0, "odd number of I/Q components");
        Self {
            sequence,
            timestamp: Utc::now(),
            samples,
        }
    }

    /// Number of complex samples.
    pub fn len(&self) -> usize {
        self.samples.len() / 2
    }

    /// True if the buffer carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate the buffer as complex values.
    pub fn iq(&self) -> impl Iterator<Item = Complex<i16>> + '_ {
        self.samples
            .chunks_exact(2)
            .map(|pair| Complex::new(pair[0], pair[1]))
    }

    /// Keep only the first `samples` complex samples.
    pub fn truncate(&mut self, samples: usize) {
        self.samples.truncate(samples * 2);
    }

    /// Append the little-endian encoding of this buffer to `out`.
    pub fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.reserve(self.samples.len() * 2);
        for v in &self.samples {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Decode little-endian `sc16` bytes. A trailing odd byte is ignored.
    pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }
}

/// A contiguous run of raw buffers awaiting compression.
#[derive(Debug)]
pub struct RawChunk {
    /// Dense position of this chunk in the session, used for reordering
    pub ordinal: u64,
    /// Buffers in ascending, contiguous sequence order
    pub buffers: Vec<SampleBuffer>,
}

impl RawChunk {
    /// Sequence range covered, or `None` for an empty run.
    pub fn range(&self) -> Option<SequenceRange> {
        let first = self.buffers.first()?;
        let last = self.buffers.last()?;
        Some(SequenceRange::new(first.sequence, last.sequence))
    }

    /// Total complex samples across all buffers.
    pub fn sample_count(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }

    /// Concatenated little-endian payload of every buffer.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sample_count() as usize * BYTES_PER_SAMPLE);
        for buffer in &self.buffers {
            buffer.write_le_bytes(&mut out);
        }
        out
    }
}

/// A compressed, checksummed chunk ready for persistence.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Dense position of this chunk in the session
    pub ordinal: u64,
    /// Buffer sequence numbers covered
    pub range: SequenceRange,
    /// Complex samples in the decompressed payload
    pub sample_count: u64,
    /// Compressed bytes
    pub payload: Vec<u8>,
    /// SHA-256 of `payload`
    pub checksum: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_range() {
        let a = SequenceRange::new(0, 9);
        let b = SequenceRange::new(10, 14);
        assert_eq!(a.len(), 10);
        assert!(b.follows(&a));
        assert!(!a.follows(&b));
        assert!(a.contains(9));
        assert!(!a.contains(10));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&SequenceRange::single(5)));
        assert_eq!(a.to_string(), "0..=9");
    }

    #[test]
    fn test_buffer_byte_layout_is_little_endian() {
        let buffer = SampleBuffer::new(0, vec![1, -1, 256, -32768]);
        let mut bytes = Vec::new();
        buffer.write_le_bytes(&mut bytes);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFF, 0xFF, 0x00, 0x01, 0x00, 0x80]);
        assert_eq!(SampleBuffer::samples_from_le_bytes(&bytes), buffer.samples);
    }

    #[test]
    fn test_iq_view_and_truncate() {
        let mut buffer = SampleBuffer::new(3, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.len(), 3);
        let iq: Vec<_> = buffer.iq().collect();
        assert_eq!(iq[1], Complex::new(3, 4));

        buffer.truncate(2);
        assert_eq!(buffer.samples, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_raw_chunk_range_and_payload() {
        let chunk = RawChunk {
            ordinal: 0,
            buffers: vec![
                SampleBuffer::new(4, vec![1, 2]),
                SampleBuffer::new(5, vec![3, 4, 5, 6]),
            ],
        };
        assert_eq!(chunk.range(), Some(SequenceRange::new(4, 5)));
        assert_eq!(chunk.sample_count(), 3);
        assert_eq!(chunk.to_le_bytes().len(), 3 * BYTES_PER_SAMPLE);
    }
}
