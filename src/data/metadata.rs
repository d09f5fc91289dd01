//! Session metadata record (`B.meta`).
//!
//! A plain `key=value` text file, one entry per line, `#` starts a comment. It is written once
//! when the session is finalized and is read by the replay path and by external analysis
//! tooling. Unknown keys are ignored on load so newer writers stay readable.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::codec::Compression;
use crate::error::StorageError;

/// Sample format tag written to every record.
pub const DATA_TYPE: &str = "sc16";

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Still running (never persisted by a finalized session)
    Running,
    /// Reached its duration or end of input
    Completed,
    /// Stopped on request
    Cancelled,
    /// Aborted by an error
    Failed,
}

impl SessionStatus {
    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Values known only when a session ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finalization {
    /// Wall-clock duration
    pub duration_seconds: f64,
    /// Samples persisted (capture) or transmitted (replay)
    pub samples: u64,
    /// Chunks persisted or replayed
    pub chunks: u64,
    /// Queue drops + overruns + underruns
    pub overflow_count: u64,
    /// Uncompressed bytes
    pub original_size_bytes: u64,
    /// Compressed bytes
    pub compressed_size_bytes: u64,
    /// Final status
    pub status: Option<SessionStatus>,
}

/// Per-session metadata.
///
/// Created at session start, finalized exactly once at session end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub center_frequency_hz: f64,
    pub sample_rate_hz: f64,
    pub gain_db: f64,
    pub compression: Compression,
    pub compression_level: i32,
    pub compression_threads: usize,
    pub buffer_samples: usize,
    /// `None` until finalized
    pub duration_seconds: Option<f64>,
    /// `None` until finalized
    pub samples: Option<u64>,
    pub chunks: u64,
    pub overflow_count: u64,
    pub original_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub status: SessionStatus,
}

impl SessionMetadata {
    /// Start-of-session record.
    pub fn new(
        center_frequency_hz: f64,
        sample_rate_hz: f64,
        gain_db: f64,
        compression: Compression,
        compression_level: i32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            center_frequency_hz,
            sample_rate_hz,
            gain_db,
            compression,
            compression_level,
            compression_threads: 1,
            buffer_samples: 0,
            duration_seconds: None,
            samples: None,
            chunks: 0,
            overflow_count: 0,
            original_size_bytes: 0,
            compressed_size_bytes: 0,
            status: SessionStatus::Running,
        }
    }

    /// Set worker thread count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.compression_threads = threads;
        self
    }

    /// Set device buffer size.
    pub fn with_buffer_samples(mut self, buffer_samples: usize) -> Self {
        self.buffer_samples = buffer_samples;
        self
    }

    /// Close the record. Consumes the start record so it can only happen once.
    pub fn finalize(mut self, end: Finalization) -> Self {
        self.duration_seconds = Some(end.duration_seconds);
        self.samples = Some(end.samples);
        self.chunks = end.chunks;
        self.overflow_count = end.overflow_count;
        self.original_size_bytes = end.original_size_bytes;
        self.compressed_size_bytes = end.compressed_size_bytes;
        self.status = end.status.unwrap_or(SessionStatus::Completed);
        self
    }

    /// Whether `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.samples.is_some()
    }

    /// Original / compressed size, if anything was stored.
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.compressed_size_bytes > 0)
            .then(|| self.original_size_bytes as f64 / self.compressed_size_bytes as f64)
    }

    /// Render as `key=value` text.
    pub fn to_text(&self) -> String {
        let mut out = String::from("# RF Recording Metadata\n");
        let mut put = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "{key}={value}");
        };
        put("session_id", &self.session_id);
        put("timestamp", &self.timestamp.to_rfc3339());
        put("center_frequency_hz", &self.center_frequency_hz);
        put("sample_rate_hz", &self.sample_rate_hz);
        put("gain_db", &self.gain_db);
        if let Some(duration) = self.duration_seconds {
            put("duration_seconds", &format!("{duration:.6}"));
        }
        if let Some(samples) = self.samples {
            put("samples", &samples);
        }
        put("data_type", &DATA_TYPE);
        put("compression", &self.compression);
        put("compression_level", &self.compression_level);
        put("compression_threads", &self.compression_threads);
        put("buffer_samples", &self.buffer_samples);
        put("chunks", &self.chunks);
        put("overflow_count", &self.overflow_count);
        put("original_size_bytes", &self.original_size_bytes);
        put("compressed_size_bytes", &self.compressed_size_bytes);
        if let Some(ratio) = self.compression_ratio() {
            put("compression_ratio", &format!("{ratio:.2}"));
        }
        put("status", &self.status.as_str());
        out
    }

    /// Parse `key=value` text.
    pub fn from_text(text: &str) -> Result<Self, String> {
        let entries: BTreeMap<&str, &str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        fn parse<T: FromStr>(entries: &BTreeMap<&str, &str>, key: &str) -> Result<Option<T>, String> {
            entries
                .get(key)
                .map(|raw| raw.parse::<T>().map_err(|_| format!("invalid {key} '{raw}'")))
                .transpose()
        }
        fn required<T: FromStr>(entries: &BTreeMap<&str, &str>, key: &str) -> Result<T, String> {
            parse(entries, key)?.ok_or_else(|| format!("missing required key '{key}'"))
        }

        if let Some(data_type) = entries.get("data_type") {
            if *data_type != DATA_TYPE {
                return Err(format!("unsupported data_type '{data_type}'"));
            }
        }
        let compression: Compression = entries
            .get("compression")
            .ok_or_else(|| "missing required key 'compression'".to_string())?
            .parse()
            .map_err(|e: crate::error::PipelineError| e.to_string())?;
        let timestamp = entries
            .get("timestamp")
            .ok_or_else(|| "missing required key 'timestamp'".to_string())
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
            })?;

        Ok(Self {
            session_id: parse(&entries, "session_id")?.unwrap_or_else(Uuid::nil),
            timestamp,
            center_frequency_hz: required(&entries, "center_frequency_hz")?,
            sample_rate_hz: required(&entries, "sample_rate_hz")?,
            gain_db: required(&entries, "gain_db")?,
            compression_level: parse(&entries, "compression_level")?
                .unwrap_or_else(|| compression.default_level()),
            compression,
            compression_threads: parse(&entries, "compression_threads")?.unwrap_or(1),
            buffer_samples: parse(&entries, "buffer_samples")?.unwrap_or(0),
            duration_seconds: parse(&entries, "duration_seconds")?,
            samples: parse(&entries, "samples")?,
            chunks: parse(&entries, "chunks")?.unwrap_or(0),
            overflow_count: parse(&entries, "overflow_count")?.unwrap_or(0),
            original_size_bytes: parse(&entries, "original_size_bytes")?.unwrap_or(0),
            compressed_size_bytes: parse(&entries, "compressed_size_bytes")?.unwrap_or(0),
            status: parse(&entries, "status")?.unwrap_or(SessionStatus::Completed),
        })
    }

    /// Write to `path`, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<(), StorageError> {
        let tmp = path.with_extension("meta.tmp");
        std::fs::write(&tmp, self.to_text()).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let text = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        Self::from_text(&text).map_err(|message| StorageError::Metadata {
            path: path.to_path_buf(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finalized() -> SessionMetadata {
        SessionMetadata::new(100.1e6, 2e6, 30.0, Compression::Zstd, 3)
            .with_threads(7)
            .with_buffer_samples(8192)
            .finalize(Finalization {
                duration_seconds: 10.0,
                samples: 20_000_000,
                chunks: 77,
                overflow_count: 2,
                original_size_bytes: 80_000_000,
                compressed_size_bytes: 40_000_000,
                status: Some(SessionStatus::Cancelled),
            })
    }

    #[test]
    fn test_text_contains_required_keys() {
        let text = finalized().to_text();
        assert!(text.starts_with("# RF Recording Metadata\n"));
        for key in [
            "center_frequency_hz=100100000",
            "sample_rate_hz=2000000",
            "gain_db=30",
            "duration_seconds=10.000000",
            "samples=20000000",
            "compression=zstd",
            "compression_level=3",
            "timestamp=",
            "data_type=sc16",
            "compression_ratio=2.00",
            "status=cancelled",
        ] {
            assert!(text.contains(key), "missing {key} in\n{text}");
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.meta");
        let meta = finalized();
        meta.write(&path).unwrap();
        let loaded = SessionMetadata::load(&path).unwrap();
        assert_eq!(loaded.session_id, meta.session_id);
        assert_eq!(loaded.samples, Some(20_000_000));
        assert_eq!(loaded.sample_rate_hz, 2e6);
        assert_eq!(loaded.status, SessionStatus::Cancelled);
        assert_eq!(loaded.buffer_samples, 8192);
        assert!(!dir.path().join("s.meta.tmp").exists());
    }

    #[test]
    fn test_load_ignores_comments_and_unknown_keys() {
        let text = "# comment\n\
                    center_frequency_hz=915e6\n\
                    sample_rate_hz=1000000\n\
                    gain_db=10\n\
                    compression=gzip\n\
                    timestamp=2024-05-01T12:00:00Z\n\
                    visualization=true\n";
        let meta = SessionMetadata::from_text(text).unwrap();
        assert_eq!(meta.center_frequency_hz, 915e6);
        assert_eq!(meta.compression, Compression::Gzip);
        assert_eq!(meta.compression_level, 3);
        assert_eq!(meta.samples, None);
        assert!(!meta.is_finalized());
    }

    #[test]
    fn test_load_rejects_missing_and_foreign_type() {
        assert!(SessionMetadata::from_text("compression=none\n").is_err());
        let text = finalized().to_text().replace("data_type=sc16", "data_type=cf32");
        assert!(SessionMetadata::from_text(&text)
            .unwrap_err()
            .contains("data_type"));
    }
}
