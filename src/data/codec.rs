//! Chunk payload codecs and checksums.
//!
//! Compression is lossless and deterministic: the same raw bytes and level always produce the
//! same payload, so a re-capture of identical samples yields identical chunk checksums.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Compression method for chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Raw little-endian samples
    None,
    /// Deflate in a gzip container
    Gzip,
    /// Zstandard
    #[default]
    Zstd,
}

impl Compression {
    /// Inclusive range of accepted levels.
    pub fn level_range(&self) -> (i32, i32) {
        match self {
            Self::None => (0, 0),
            Self::Gzip => (0, 9),
            Self::Zstd => (1, 22),
        }
    }

    /// Level used when none is configured.
    pub fn default_level(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::Gzip | Self::Zstd => 3,
        }
    }

    /// Name as written to session metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(PipelineError::Configuration(format!(
                "Unsupported compression method '{other}' (expected none, gzip or zstd)"
            ))),
        }
    }
}

/// A compression method bound to a validated level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    compression: Compression,
    level: i32,
}

impl Codec {
    /// Validate `level` for `compression`; `None` selects the method's default.
    pub fn new(compression: Compression, level: Option<i32>) -> Result<Self> {
        let level = level.unwrap_or_else(|| compression.default_level());
        let (min, max) = compression.level_range();
        if compression != Compression::None && !(min..=max).contains(&level) {
            return Err(PipelineError::Configuration(format!(
                "{compression} level must be between {min} and {max}, got {level}"
            )));
        }
        Ok(Self {
            compression,
            level: if compression == Compression::None { 0 } else { level },
        })
    }

    /// Compression method.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Effective level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Compress one chunk of raw sample bytes.
    pub fn compress(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(raw.to_vec()),
            Compression::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::with_capacity(raw.len() / 2),
                    flate2::Compression::new(self.level as u32),
                );
                encoder.write_all(raw)?;
                encoder.finish()
            }
            Compression::Zstd => zstd::bulk::compress(raw, self.level),
        }
    }

    /// Decompress a payload that must expand to exactly `expected_len` bytes.
    pub fn decompress(&self, payload: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
        let raw = match self.compression {
            Compression::None => payload.to_vec(),
            Compression::Gzip => {
                let mut raw = Vec::with_capacity(expected_len);
                flate2::read::GzDecoder::new(payload).read_to_end(&mut raw)?;
                raw
            }
            Compression::Zstd => zstd::bulk::decompress(payload, expected_len)?,
        };
        if raw.len() != expected_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "payload expanded to {} bytes, index records {expected_len}",
                    raw.len()
                ),
            ));
        }
        Ok(raw)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            level: Compression::default().default_level(),
        }
    }
}

/// SHA-256 of a stored payload.
pub fn checksum(payload: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(payload);
    let mut sum = [0u8; 32];
    sum.copy_from_slice(&digest);
    sum
}

/// Lower-case hex rendering of a checksum.
pub fn checksum_hex(sum: &[u8; 32]) -> String {
    sum.iter().map(|b| format!("{b:02x}")).collect()
}
