//! CLI Entry Point for rf_recorder
//!
//! Provides command-line access to:
//! - Capturing IQ samples from a device to a compressed recording
//! - Replaying a recording to a transmit device, optionally looping
//! - Inspecting and verifying a recording
//! - Listing device drivers and printing the effective configuration
//!
//! # Usage
//!
//! Capture ten seconds of FM broadcast:
//! ```bash
//! rf_recorder capture -f 100.1e6 -r 2e6 -d 10 -o fm --device driver=mock
//! ```
//!
//! Replay it three times with a one second pause:
//! ```bash
//! rf_recorder replay recordings/fm --on-gap abort --loops 3 --delay 1
//! ```
//!
//! Ctrl-C cancels the running session cooperatively; the recording stays valid.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rf_recorder::config::{AppConfig, GapPolicy};
use rf_recorder::controller::{LoopError, LoopReport, ReplayLoop};
use rf_recorder::core::SequenceRange;
use rf_recorder::data::chunk_file::{ChunkReader, SessionPaths};
use rf_recorder::data::codec::Compression;
use rf_recorder::data::metadata::SessionMetadata;
use rf_recorder::hardware::{list_drivers, open_device, Direction};
use rf_recorder::logging;
use rf_recorder::pipeline::{PipelineStats, StopReason, StopSignal};
use rf_recorder::session::{start_capture, SessionFailure, SessionHandle, SessionReport};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rf_recorder")]
#[command(about = "Lossless IQ capture and timing-accurate replay for SDRs", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/rf_recorder.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture IQ samples to a compressed recording
    Capture(CaptureArgs),

    /// Replay a recording to a transmit device
    Replay(ReplayArgs),

    /// Print a recording's metadata and verify every chunk
    Inspect {
        /// Recording base path (or any of its .dat/.idx/.meta files)
        recording: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List available device drivers
    Devices,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct CaptureArgs {
    /// Center frequency in Hz
    #[arg(short = 'f', long)]
    freq: f64,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value_t = 2e6)]
    rate: f64,

    /// Capture duration in seconds (runs until Ctrl-C when omitted)
    #[arg(short = 'd', long)]
    duration: Option<f64>,

    /// RF gain in dB
    #[arg(short = 'g', long, default_value_t = 0.0)]
    gain: f64,

    /// Recording name or path; names are placed under storage.output_dir
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Device connection string
    #[arg(long)]
    device: Option<String>,

    /// Compression method (none, gzip, zstd)
    #[arg(short = 'c', long)]
    compression: Option<Compression>,

    /// Compression level
    #[arg(short = 'l', long)]
    level: Option<i32>,

    /// Buffers per compressed chunk
    #[arg(long)]
    chunk_buffers: Option<usize>,

    /// Complex samples per device buffer
    #[arg(long)]
    buffer_samples: Option<usize>,

    /// Compression worker threads
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Abort when the overflow rate crosses the degraded threshold
    #[arg(long)]
    abort_on_degraded: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReplayArgs {
    /// Recording base path (or any of its .dat/.idx/.meta files)
    recording: PathBuf,

    /// What to do when a range is missing or corrupt (abort, skip)
    #[arg(long)]
    on_gap: Option<GapPolicy>,

    /// Device connection string
    #[arg(long)]
    device: Option<String>,

    /// Override the recorded center frequency in Hz
    #[arg(short = 'f', long)]
    freq: Option<f64>,

    /// Override the recorded sample rate in Hz
    #[arg(short = 'r', long)]
    rate: Option<f64>,

    /// Override the recorded gain in dB
    #[arg(short = 'g', long)]
    gain: Option<f64>,

    /// Amplitude scale factor
    #[arg(short = 's', long, default_value_t = 1.0)]
    scale: f32,

    /// First buffer sequence to replay
    #[arg(long)]
    start: Option<u64>,

    /// Last buffer sequence to replay (inclusive)
    #[arg(long)]
    end: Option<u64>,

    /// Stop each pass after this many seconds
    #[arg(short = 'd', long)]
    duration: Option<f64>,

    /// Number of passes
    #[arg(long, default_value_t = 1, conflicts_with = "forever")]
    loops: u32,

    /// Loop until Ctrl-C
    #[arg(long)]
    forever: bool,

    /// Pause between passes in seconds (defaults to replay.loop_delay)
    #[arg(long)]
    delay: Option<f64>,

    /// Decompression worker threads
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut app = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        app.application.log_level = level.clone();
    }
    app.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&app).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Capture(args) => capture(&app, args).await,
        Commands::Replay(args) => replay(&app, args).await,
        Commands::Inspect { recording, json } => inspect(&recording, json),
        Commands::Devices => {
            devices();
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&app)?);
            Ok(())
        }
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {what}: {value}"))
}

async fn capture(app: &AppConfig, args: CaptureArgs) -> Result<()> {
    let name = args.output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "capture_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ))
    });

    let mut builder = app
        .capture_builder()
        .output(app.resolve_output(&name))
        .center_frequency(args.freq)
        .sample_rate(args.rate)
        .gain(args.gain);
    if let Some(duration) = args.duration {
        builder = builder.duration(seconds(duration, "duration")?);
    }
    if args.compression.is_some() || args.level.is_some() {
        builder = builder.compression(
            args.compression.unwrap_or(app.storage.compression),
            args.level.or(app.storage.compression_level),
        );
    }
    if let Some(buffers) = args.chunk_buffers {
        builder = builder.buffers_per_chunk(buffers);
    }
    if let Some(samples) = args.buffer_samples {
        builder = builder.buffer_samples(samples);
    }
    if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    if args.abort_on_degraded {
        builder = builder.degraded(app.monitor.threshold(), true);
    }
    let config = builder.build()?;

    let device_args = args.device.as_deref().unwrap_or(&app.capture.device);
    let device = open_device(device_args, Direction::Rx)?;
    let handle = start_capture(config, device)?;
    let outcome = run_until_interrupted(handle).await?;
    finish(outcome, args.json)
}

async fn replay(app: &AppConfig, args: ReplayArgs) -> Result<()> {
    let mut builder = app.replay_builder().scale(args.scale);
    if let Some(policy) = args.on_gap {
        builder = builder.on_gap(policy);
    }
    if let Some(freq) = args.freq {
        builder = builder.center_frequency(freq);
    }
    if let Some(rate) = args.rate {
        builder = builder.sample_rate(rate);
    }
    if let Some(gain) = args.gain {
        builder = builder.gain(gain);
    }
    if args.start.is_some() || args.end.is_some() {
        builder = builder.range(SequenceRange::new(
            args.start.unwrap_or(0),
            args.end.unwrap_or(u64::MAX),
        ));
    }
    if let Some(duration) = args.duration {
        builder = builder.duration(seconds(duration, "duration")?);
    }
    if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    let config = builder
        .build()
        .context("Replay needs a gap policy: pass --on-gap abort|skip or set replay.on_gap")?;

    let delay = match args.delay {
        Some(delay) => seconds(delay, "delay")?,
        None => app.replay.loop_delay,
    };
    let loops = if args.forever { None } else { Some(args.loops) };
    let replay = ReplayLoop::new(app.resolve_output(&args.recording), config)
        .loops(loops)
        .delay(delay);

    let stop = replay.stop_signal();
    let device_args = args
        .device
        .clone()
        .unwrap_or_else(|| app.replay.device.clone());
    let task = tokio::task::spawn_blocking(move || {
        replay.run(|| open_device(&device_args, Direction::Tx))
    });
    let outcome = cancel_on_ctrl_c(task, &stop).await?;

    match outcome {
        Ok(report) => {
            print_loop(&report, args.json)?;
            Ok(())
        }
        Err(LoopError::Pass {
            pass,
            completed,
            failure,
        }) => {
            print_loop(&completed, args.json)?;
            print_report(&failure.report, args.json)?;
            Err(anyhow::Error::new(failure).context(format!("Replay pass {pass} failed")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Join a session on a blocking task, cancelling it on Ctrl-C.
async fn run_until_interrupted(
    handle: SessionHandle,
) -> Result<std::result::Result<SessionReport, SessionFailure>> {
    let stop = handle.stop_signal();
    info!(session = %handle.id(), "Session running, press Ctrl-C to stop");
    let task = tokio::task::spawn_blocking(move || handle.join());
    cancel_on_ctrl_c(task, &stop).await
}

async fn cancel_on_ctrl_c<T>(
    mut task: tokio::task::JoinHandle<T>,
    stop: &Arc<StopSignal>,
) -> Result<T> {
    tokio::select! {
        joined = &mut task => return Ok(joined?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Interrupted, stopping session");
            stop.stop(StopReason::Requested);
        }
    }
    Ok(task.await?)
}

fn finish(outcome: std::result::Result<SessionReport, SessionFailure>, json: bool) -> Result<()> {
    match outcome {
        Ok(report) => print_report(&report, json),
        Err(failure) => {
            print_report(&failure.report, json)?;
            Err(failure.into())
        }
    }
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let meta = &report.metadata;
    println!("Session:      {}", meta.session_id);
    println!("Recording:    {}", report.recording.display());
    println!("Status:       {}", meta.status.as_str());
    if let Some(reason) = report.stop_reason {
        println!("Stop reason:  {reason:?}");
    }
    println!("Samples:      {}", report.samples());
    println!("Duration:     {:.3} s", meta.duration_seconds.unwrap_or(0.0));
    println!("Chunks:       {}", meta.chunks);
    if let Some(ratio) = meta.compression_ratio() {
        println!("Compression:  {} level {} ({ratio:.2}x)", meta.compression, meta.compression_level);
    }
    println!("Overflows:    {}", meta.overflow_count);
    for range in &report.skipped {
        println!("Skipped:      {range}");
    }
    print_stats(&report.stats);
    Ok(())
}

fn print_stats(stats: &PipelineStats) {
    println!(
        "Device:       {} buffers, {} samples, {} overruns, {} underruns, {} timeouts",
        stats.device.buffers,
        stats.device.samples,
        stats.device.overruns,
        stats.device.underruns,
        stats.device.timeouts
    );
    for queue in &stats.queues {
        println!(
            "Queue {:<7} capacity {}, high water {}, dropped {}",
            queue.name, queue.capacity, queue.high_water, queue.dropped
        );
    }
    for stage in &stats.stages {
        println!(
            "Stage {:<13} {} in, {} out, {} samples",
            stage.name, stage.units_in, stage.units_out, stage.samples
        );
    }
    if stats.degraded {
        println!("Pipeline was degraded when the session ended");
    }
}

fn print_loop(report: &LoopReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for (pass, session) in report.recent_passes() {
        println!("--- Pass {pass} ---");
        print_report(session, false)?;
    }
    println!(
        "Passes: {}, samples: {}, skipped ranges: {}{}",
        report.passes,
        report.samples,
        report.skipped,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn inspect(recording: &Path, json: bool) -> Result<()> {
    let paths = SessionPaths::new(recording);
    let metadata = SessionMetadata::load(&paths.meta)?;
    let mut reader = ChunkReader::open(paths.clone())?;
    let indexed = reader.total_samples();
    let span = reader.sequence_span();
    let report = reader.verify()?;

    if json {
        let out = serde_json::json!({
            "metadata": metadata,
            "indexed_samples": indexed,
            "sequence_span": span,
            "verify": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print!("{}", metadata.to_text());
        println!("# index: {} chunks, {} samples", report.chunks, indexed);
        if let Some(span) = span {
            println!("# sequences: {span}");
        }
        for gap in &report.gaps {
            println!("# gap: {gap}");
        }
        for corrupt in &report.corrupt {
            println!("# checksum mismatch: {corrupt}");
        }
        println!(
            "# verified: {} of {} samples",
            report.valid_samples, indexed
        );
    }

    if metadata.samples.is_some_and(|samples| samples != indexed) {
        warn!(
            metadata = metadata.samples.unwrap_or(0),
            indexed,
            "Metadata sample count differs from the index"
        );
    }
    if !report.is_clean() {
        bail!("{} corrupt chunk(s) in {}", report.corrupt.len(), paths.base.display());
    }
    Ok(())
}

fn devices() {
    for driver in list_drivers() {
        let directions: Vec<&str> = driver
            .directions
            .iter()
            .map(|d| match d {
                Direction::Rx => "rx",
                Direction::Tx => "tx",
            })
            .collect();
        println!("{:<6} [{}] {}", driver.name, directions.join(","), driver.description);
        println!("       e.g. {}", driver.example);
    }
}
