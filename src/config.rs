//! Configuration.
//!
//! Two layers:
//!
//! - [`AppConfig`]: the file/environment configuration, loaded with figment from a TOML file
//!   merged with `RF_RECORDER_`-prefixed environment variables. Nested keys are separated by a
//!   double underscore, e.g. `RF_RECORDER_CAPTURE__WORKERS=4`.
//! - [`CaptureConfig`] / [`ReplayConfig`]: validated runtime settings for a single session,
//!   built with a builder seeded from the file configuration and overridden by the caller.
//!
//! # Example
//! ```no_run
//! use rf_recorder::config::AppConfig;
//!
//! let app = AppConfig::load()?;
//! app.validate().map_err(rf_recorder::PipelineError::Configuration)?;
//! let capture = app
//!     .capture_builder()
//!     .center_frequency(100.1e6)
//!     .sample_rate(2e6)
//!     .output("recordings/fm")
//!     .build()?;
//! # Ok::<(), rf_recorder::PipelineError>(())
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::core::SequenceRange;
use crate::data::codec::{Codec, Compression};
use crate::error::{PipelineError, Result};
use crate::pipeline::monitor::DegradedThreshold;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RF_RECORDER_";

/// Config file looked up relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rf_recorder.toml";

/// Worker threads to use when none are configured: all cores but one, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// What replay does when a range of the recording is missing or corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Fail the session with a gap or checksum error
    Abort,
    /// Log and count the hole, then continue with the next chunk
    Skip,
}

impl fmt::Display for GapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
        })
    }
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("Invalid gap policy '{other}'. Must be one of: abort, skip")),
        }
    }
}

// =============================================================================
// File configuration
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Capture pipeline sizing
    pub capture: CaptureSection,
    /// Storage settings
    pub storage: StorageSection,
    /// Replay pipeline sizing
    pub replay: ReplaySection,
    /// Degraded-mode policy
    pub monitor: MonitorSection,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rf_recorder".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Capture pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Device connection string
    pub device: String,
    /// Complex samples per device buffer
    pub buffer_samples: usize,
    /// Buffers compressed together into one chunk
    pub buffers_per_chunk: usize,
    /// Raw queue capacity in buffers (drop-oldest)
    pub raw_queue_capacity: usize,
    /// Compressed queue capacity in chunks
    pub compressed_queue_capacity: usize,
    /// Compression workers (default: cores - 1)
    pub workers: Option<usize>,
    /// Chunks a worker may run ahead of the oldest unfinished one
    pub reorder_span: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            device: "driver=mock".to_string(),
            buffer_samples: 8192,
            buffers_per_chunk: 32,
            raw_queue_capacity: 512,
            compressed_queue_capacity: 20,
            workers: None,
            reorder_span: 64,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory for recordings given by bare name
    pub output_dir: PathBuf,
    /// Compression method
    pub compression: Compression,
    /// Compression level (method default when absent)
    pub compression_level: Option<i32>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            compression: Compression::Zstd,
            compression_level: None,
        }
    }
}

/// Replay pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    /// Device connection string
    pub device: String,
    /// Buffer size used when the recording does not state one
    pub buffer_samples: usize,
    /// Buffers queued before the first write
    pub prime_depth: usize,
    /// Compressed queue capacity in chunks
    pub compressed_queue_capacity: usize,
    /// Raw queue capacity in buffers
    pub raw_queue_capacity: usize,
    /// Decompression workers (default: cores - 1)
    pub workers: Option<usize>,
    /// Chunks a worker may run ahead of the oldest unfinished one
    pub reorder_span: usize,
    /// Gap policy; has no default and must be stated here or on the command line
    pub on_gap: Option<GapPolicy>,
    /// Pause between loop passes
    #[serde(with = "humantime_serde")]
    pub loop_delay: Duration,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            device: "driver=null".to_string(),
            buffer_samples: 8192,
            prime_depth: 16,
            compressed_queue_capacity: 8,
            raw_queue_capacity: 128,
            workers: None,
            reorder_span: 16,
            on_gap: None,
            loop_delay: Duration::from_secs(1),
        }
    }
}

/// Degraded-mode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    /// More than this many overflow events inside `window` is degraded
    pub max_events: u64,
    /// Sliding window width
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Abort the session when degraded instead of only reporting it
    pub abort_on_degraded: bool,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let threshold = DegradedThreshold::default();
        Self {
            max_events: threshold.max_events,
            window: threshold.window,
            abort_on_degraded: false,
        }
    }
}

impl MonitorSection {
    /// Threshold handed to the overflow monitor.
    pub fn threshold(&self) -> DegradedThreshold {
        DegradedThreshold {
            max_events: self.max_events,
            window: self.window,
        }
    }
}

impl AppConfig {
    /// Load from the default config path (see [`default_config_path`]) and the environment.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; every key has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        Codec::new(self.storage.compression, self.storage.compression_level)
            .map_err(|e| e.to_string())?;

        let capture = &self.capture;
        for (name, value) in [
            ("capture.buffer_samples", capture.buffer_samples),
            ("capture.buffers_per_chunk", capture.buffers_per_chunk),
            ("capture.raw_queue_capacity", capture.raw_queue_capacity),
            ("capture.compressed_queue_capacity", capture.compressed_queue_capacity),
            ("capture.reorder_span", capture.reorder_span),
            ("replay.buffer_samples", self.replay.buffer_samples),
            ("replay.prime_depth", self.replay.prime_depth),
            ("replay.compressed_queue_capacity", self.replay.compressed_queue_capacity),
            ("replay.raw_queue_capacity", self.replay.raw_queue_capacity),
            ("replay.reorder_span", self.replay.reorder_span),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if capture.buffers_per_chunk > capture.raw_queue_capacity {
            return Err(format!(
                "capture.buffers_per_chunk ({}) cannot exceed capture.raw_queue_capacity ({})",
                capture.buffers_per_chunk, capture.raw_queue_capacity
            ));
        }
        if capture.workers == Some(0) || self.replay.workers == Some(0) {
            return Err("workers must be at least 1".to_string());
        }
        if self.monitor.window.is_zero() {
            return Err("monitor.window must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Capture builder seeded from this configuration.
    pub fn capture_builder(&self) -> CaptureConfigBuilder {
        let c = &self.capture;
        CaptureConfig::builder()
            .buffer_samples(c.buffer_samples)
            .buffers_per_chunk(c.buffers_per_chunk)
            .queue_capacities(c.raw_queue_capacity, c.compressed_queue_capacity)
            .workers(c.workers.unwrap_or_else(default_workers))
            .reorder_span(c.reorder_span)
            .compression(self.storage.compression, self.storage.compression_level)
            .degraded(self.monitor.threshold(), self.monitor.abort_on_degraded)
    }

    /// Replay builder seeded from this configuration.
    pub fn replay_builder(&self) -> ReplayConfigBuilder {
        let r = &self.replay;
        let builder = ReplayConfig::builder()
            .buffer_samples(r.buffer_samples)
            .prime_depth(r.prime_depth)
            .queue_capacities(r.compressed_queue_capacity, r.raw_queue_capacity)
            .workers(r.workers.unwrap_or_else(default_workers))
            .reorder_span(r.reorder_span)
            .degraded(self.monitor.threshold(), self.monitor.abort_on_degraded);
        match r.on_gap {
            Some(policy) => builder.on_gap(policy),
            None => builder,
        }
    }

    /// Resolve a recording name against `storage.output_dir` unless it is already a path.
    pub fn resolve_output(&self, name: &Path) -> PathBuf {
        if name.is_absolute() || name.components().count() > 1 {
            name.to_path_buf()
        } else {
            self.storage.output_dir.join(name)
        }
    }
}

/// `config/rf_recorder.toml` if present, else `<user config dir>/rf_recorder/config.toml`.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_PATH);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("rf_recorder").join("config.toml"))
        .unwrap_or(local)
}

// =============================================================================
// Runtime session configuration
// =============================================================================

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(message.into())
}

fn check_radio(center_frequency_hz: f64, sample_rate_hz: f64) -> Result<()> {
    if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
        return Err(invalid(format!("Invalid sample rate: {sample_rate_hz}")));
    }
    if !(center_frequency_hz.is_finite() && center_frequency_hz >= 0.0) {
        return Err(invalid(format!(
            "Invalid center frequency: {center_frequency_hz}"
        )));
    }
    Ok(())
}

/// Settings for one capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Session base path (`.dat`, `.idx` and `.meta` are appended)
    pub output: PathBuf,
    /// Center frequency in Hz
    pub center_frequency_hz: f64,
    /// Sample rate in Hz
    pub sample_rate_hz: f64,
    /// RF gain in dB
    pub gain_db: f64,
    /// Capture length; `None` runs until cancelled or the source ends
    pub duration: Option<Duration>,
    /// Chunk codec
    pub codec: Codec,
    /// Complex samples per device buffer
    pub buffer_samples: usize,
    /// Buffers per compressed chunk
    pub buffers_per_chunk: usize,
    /// Raw queue capacity in buffers
    pub raw_queue_capacity: usize,
    /// Compressed queue capacity in chunks
    pub compressed_queue_capacity: usize,
    /// Compression workers
    pub workers: usize,
    /// Reorder window span in chunks
    pub reorder_span: usize,
    /// Degraded threshold
    pub degraded: DegradedThreshold,
    /// Abort when degraded
    pub abort_on_degraded: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let section = CaptureSection::default();
        Self {
            output: PathBuf::from("capture"),
            center_frequency_hz: 100e6,
            sample_rate_hz: 2e6,
            gain_db: 0.0,
            duration: None,
            codec: Codec::default(),
            buffer_samples: section.buffer_samples,
            buffers_per_chunk: section.buffers_per_chunk,
            raw_queue_capacity: section.raw_queue_capacity,
            compressed_queue_capacity: section.compressed_queue_capacity,
            workers: default_workers(),
            reorder_span: section.reorder_span,
            degraded: DegradedThreshold::default(),
            abort_on_degraded: false,
        }
    }
}

impl CaptureConfig {
    /// Create a new builder for capture configuration.
    pub fn builder() -> CaptureConfigBuilder {
        CaptureConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        check_radio(self.center_frequency_hz, self.sample_rate_hz)?;
        if self.output.as_os_str().is_empty() {
            return Err(invalid("Output path must not be empty"));
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(invalid("Duration must be greater than 0"));
        }
        if self.buffer_samples == 0 || self.buffers_per_chunk == 0 {
            return Err(invalid("Buffer and chunk sizes must be greater than 0"));
        }
        if self.raw_queue_capacity == 0 || self.compressed_queue_capacity == 0 {
            return Err(invalid("Queue capacities must be greater than 0"));
        }
        if self.buffers_per_chunk > self.raw_queue_capacity {
            return Err(invalid(format!(
                "A chunk of {} buffers cannot fill a raw queue of {}",
                self.buffers_per_chunk, self.raw_queue_capacity
            )));
        }
        if self.workers == 0 || self.reorder_span == 0 {
            return Err(invalid("Worker count and reorder span must be at least 1"));
        }
        Ok(())
    }

    /// Samples to capture, if bounded by a duration.
    pub fn target_samples(&self) -> Option<u64> {
        self.duration
            .map(|d| (d.as_secs_f64() * self.sample_rate_hz).round() as u64)
    }
}

/// Builder for [`CaptureConfig`].
#[derive(Debug, Default)]
pub struct CaptureConfigBuilder {
    config: CaptureConfig,
    compression: Option<(Compression, Option<i32>)>,
}

impl CaptureConfigBuilder {
    /// Set the session base path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = path.into();
        self
    }

    /// Set the center frequency in Hz.
    pub fn center_frequency(mut self, hz: f64) -> Self {
        self.config.center_frequency_hz = hz;
        self
    }

    /// Set the sample rate in Hz.
    pub fn sample_rate(mut self, hz: f64) -> Self {
        self.config.sample_rate_hz = hz;
        self
    }

    /// Set the gain in dB.
    pub fn gain(mut self, db: f64) -> Self {
        self.config.gain_db = db;
        self
    }

    /// Set the capture duration.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = Some(duration);
        self
    }

    /// Set compression method and level (method default when `None`).
    pub fn compression(mut self, compression: Compression, level: Option<i32>) -> Self {
        self.compression = Some((compression, level));
        self
    }

    /// Set the device buffer size.
    pub fn buffer_samples(mut self, samples: usize) -> Self {
        self.config.buffer_samples = samples;
        self
    }

    /// Set the number of buffers per chunk.
    pub fn buffers_per_chunk(mut self, buffers: usize) -> Self {
        self.config.buffers_per_chunk = buffers;
        self
    }

    /// Set raw and compressed queue capacities.
    pub fn queue_capacities(mut self, raw: usize, compressed: usize) -> Self {
        self.config.raw_queue_capacity = raw;
        self.config.compressed_queue_capacity = compressed;
        self
    }

    /// Set the number of compression workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the reorder window span.
    pub fn reorder_span(mut self, span: usize) -> Self {
        self.config.reorder_span = span;
        self
    }

    /// Set the degraded threshold and whether crossing it aborts.
    pub fn degraded(mut self, threshold: DegradedThreshold, abort: bool) -> Self {
        self.config.degraded = threshold;
        self.config.abort_on_degraded = abort;
        self
    }

    /// Build and validate.
    pub fn build(mut self) -> Result<CaptureConfig> {
        if let Some((compression, level)) = self.compression {
            self.config.codec = Codec::new(compression, level)?;
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings for one replay session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Center frequency override (recording's value otherwise)
    pub center_frequency_hz: Option<f64>,
    /// Sample rate override (recording's value otherwise)
    pub sample_rate_hz: Option<f64>,
    /// Transmit gain override (recording's value otherwise)
    pub gain_db: Option<f64>,
    /// Amplitude scale factor, saturating at the i16 range
    pub scale: f32,
    /// Restrict replay to these sequence numbers
    pub range: Option<SequenceRange>,
    /// Stop after this long
    pub duration: Option<Duration>,
    /// Buffer size when the recording does not state one
    pub buffer_samples: usize,
    /// Buffers queued before the first write
    pub prime_depth: usize,
    /// Compressed queue capacity in chunks
    pub compressed_queue_capacity: usize,
    /// Raw queue capacity in buffers
    pub raw_queue_capacity: usize,
    /// Decompression workers
    pub workers: usize,
    /// Reorder window span in chunks
    pub reorder_span: usize,
    /// Gap policy
    pub on_gap: GapPolicy,
    /// Degraded threshold
    pub degraded: DegradedThreshold,
    /// Abort when degraded
    pub abort_on_degraded: bool,
}

impl ReplayConfig {
    /// Create a new builder for replay configuration.
    pub fn builder() -> ReplayConfigBuilder {
        ReplayConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.sample_rate_hz {
            check_radio(self.center_frequency_hz.unwrap_or(0.0), rate)?;
        } else if let Some(freq) = self.center_frequency_hz {
            check_radio(freq, 1.0)?;
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(invalid(format!("Invalid scale factor: {}", self.scale)));
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(invalid("Duration must be greater than 0"));
        }
        if self.buffer_samples == 0 || self.prime_depth == 0 {
            return Err(invalid("Buffer size and prime depth must be greater than 0"));
        }
        if self.compressed_queue_capacity == 0 || self.raw_queue_capacity == 0 {
            return Err(invalid("Queue capacities must be greater than 0"));
        }
        if self.prime_depth > self.raw_queue_capacity {
            return Err(invalid(format!(
                "Prime depth {} exceeds raw queue capacity {}",
                self.prime_depth, self.raw_queue_capacity
            )));
        }
        if self.workers == 0 || self.reorder_span == 0 {
            return Err(invalid("Worker count and reorder span must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`ReplayConfig`].
///
/// The gap policy has no default: [`build`](Self::build) fails unless
/// [`on_gap`](Self::on_gap) was called.
#[derive(Debug)]
pub struct ReplayConfigBuilder {
    config: ReplayConfig,
    on_gap: Option<GapPolicy>,
}

impl Default for ReplayConfigBuilder {
    fn default() -> Self {
        let section = ReplaySection::default();
        Self {
            config: ReplayConfig {
                center_frequency_hz: None,
                sample_rate_hz: None,
                gain_db: None,
                scale: 1.0,
                range: None,
                duration: None,
                buffer_samples: section.buffer_samples,
                prime_depth: section.prime_depth,
                compressed_queue_capacity: section.compressed_queue_capacity,
                raw_queue_capacity: section.raw_queue_capacity,
                workers: default_workers(),
                reorder_span: section.reorder_span,
                on_gap: GapPolicy::Abort,
                degraded: DegradedThreshold::default(),
                abort_on_degraded: false,
            },
            on_gap: None,
        }
    }
}

impl ReplayConfigBuilder {
    /// Override the center frequency.
    pub fn center_frequency(mut self, hz: f64) -> Self {
        self.config.center_frequency_hz = Some(hz);
        self
    }

    /// Override the sample rate.
    pub fn sample_rate(mut self, hz: f64) -> Self {
        self.config.sample_rate_hz = Some(hz);
        self
    }

    /// Override the transmit gain.
    pub fn gain(mut self, db: f64) -> Self {
        self.config.gain_db = Some(db);
        self
    }

    /// Set the amplitude scale factor.
    pub fn scale(mut self, scale: f32) -> Self {
        self.config.scale = scale;
        self
    }

    /// Restrict replay to a sequence range.
    pub fn range(mut self, range: SequenceRange) -> Self {
        self.config.range = Some(range);
        self
    }

    /// Stop after `duration`.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = Some(duration);
        self
    }

    /// Fallback buffer size.
    pub fn buffer_samples(mut self, samples: usize) -> Self {
        self.config.buffer_samples = samples;
        self
    }

    /// Buffers queued before the first write.
    pub fn prime_depth(mut self, depth: usize) -> Self {
        self.config.prime_depth = depth;
        self
    }

    /// Set compressed and raw queue capacities.
    pub fn queue_capacities(mut self, compressed: usize, raw: usize) -> Self {
        self.config.compressed_queue_capacity = compressed;
        self.config.raw_queue_capacity = raw;
        self
    }

    /// Set the number of decompression workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the reorder window span.
    pub fn reorder_span(mut self, span: usize) -> Self {
        self.config.reorder_span = span;
        self
    }

    /// Set the gap policy.
    pub fn on_gap(mut self, policy: GapPolicy) -> Self {
        self.on_gap = Some(policy);
        self
    }

    /// Set the degraded threshold and whether crossing it aborts.
    pub fn degraded(mut self, threshold: DegradedThreshold, abort: bool) -> Self {
        self.config.degraded = threshold;
        self.config.abort_on_degraded = abort;
        self
    }

    /// Build and validate.
    pub fn build(mut self) -> Result<ReplayConfig> {
        self.config.on_gap = self.on_gap.ok_or_else(|| {
            invalid("A gap policy (abort or skip) must be configured for replay")
        })?;
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_invalid_compression_level() {
        let mut config = AppConfig::default();
        config.storage.compression = Compression::Gzip;
        config.storage.compression_level = Some(12);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_larger_than_queue_rejected() {
        let mut config = AppConfig::default();
        config.capture.buffers_per_chunk = 1024;
        config.capture.raw_queue_capacity = 16;
        assert!(config.validate().unwrap_err().contains("buffers_per_chunk"));
    }

    #[test]
    fn test_capture_builder() {
        let config = CaptureConfig::builder()
            .output("/tmp/x")
            .center_frequency(433.92e6)
            .sample_rate(1e6)
            .duration(Duration::from_millis(1500))
            .compression(Compression::Gzip, Some(9))
            .workers(2)
            .build()
            .unwrap();
        assert_eq!(config.target_samples(), Some(1_500_000));
        assert_eq!(config.codec.compression(), Compression::Gzip);
        assert_eq!(config.codec.level(), 9);

        assert!(CaptureConfig::builder().sample_rate(0.0).build().is_err());
        assert!(CaptureConfig::builder()
            .compression(Compression::Zstd, Some(30))
            .build()
            .is_err());
    }

    #[test]
    fn test_replay_requires_gap_policy() {
        let err = ReplayConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("gap policy"));

        let config = ReplayConfig::builder()
            .on_gap(GapPolicy::Skip)
            .scale(0.5)
            .build()
            .unwrap();
        assert_eq!(config.on_gap, GapPolicy::Skip);
        assert!(ReplayConfig::builder()
            .on_gap(GapPolicy::Abort)
            .scale(f32::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_gap_policy_parse() {
        assert_eq!("Skip".parse::<GapPolicy>().unwrap(), GapPolicy::Skip);
        assert!("ignore".parse::<GapPolicy>().is_err());
    }

    #[test]
    fn test_resolve_output() {
        let config = AppConfig::default();
        assert_eq!(
            config.resolve_output(Path::new("fm")),
            PathBuf::from("recordings/fm")
        );
        assert_eq!(
            config.resolve_output(Path::new("/data/fm")),
            PathBuf::from("/data/fm")
        );
    }
}
