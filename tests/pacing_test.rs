//! Replay timing against a sink that does not block.

mod common;

use std::time::Duration;

use common::*;
use rf_recorder::config::{GapPolicy, ReplayConfig};
use rf_recorder::hardware::mock::MemorySink;
use rf_recorder::session::start_replay;
use tempfile::TempDir;

#[test]
fn test_replay_holds_nominal_rate_within_two_percent() {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join("paced");
    let total = 2_000_000u64; // 0.5 s at 4 MS/s
    record_ramp(&base, total, 4);

    let (outcome, probe) = replay_to_memory(&base, replay_config(GapPolicy::Abort, 4));
    let report = outcome.expect("replay completes");
    assert_eq!(report.samples(), total);

    // The last buffer is written when everything before it has played out.
    let last_buffer = total % BUFFER_SAMPLES as u64;
    let expected = Duration::from_secs_f64((total - last_buffer) as f64 / RATE);
    let span = probe.write_span().expect("sink was written");
    let tolerance = Duration::from_secs_f64(total as f64 / RATE * 0.02);
    assert!(
        span + tolerance >= expected && span <= expected + tolerance,
        "write span {span:?} outside {expected:?} ± {tolerance:?}"
    );
    assert_eq!(probe.flushes(), 1);
    assert!(probe.stopped());
}

#[test]
fn test_rate_override_slows_replay() {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join("override");
    let total = 200_000u64;
    record_ramp(&base, total, 2);

    // Recorded at 4 MS/s, replayed at 1 MS/s: about 200 ms instead of 50 ms.
    let config = ReplayConfig::builder()
        .on_gap(GapPolicy::Abort)
        .sample_rate(1e6)
        .build()
        .expect("valid replay config");
    let (outcome, probe) = replay_to_memory(&base, config);
    let report = outcome.expect("replay completes");

    assert_eq!(report.metadata.sample_rate_hz, 1e6);
    let span = probe.write_span().expect("sink was written");
    assert!(span >= Duration::from_millis(190), "span {span:?}");
}

#[test]
fn test_underruns_are_counted() {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join("underruns");
    record_ramp(&base, 100 * BUFFER_SAMPLES as u64, 2);

    let (sink, probe) = MemorySink::new();
    let sink = sink.with_underrun_every(10);
    let report = start_replay(&base, replay_config(GapPolicy::Abort, 2), Box::new(sink))
        .expect("replay starts")
        .join()
        .expect("replay completes");

    assert_eq!(report.stats.device.underruns, 10);
    assert_eq!(report.metadata.overflow_count, 10);
    // Underruns are reported, not retried: every buffer was still handed over once.
    assert_eq!(probe.sample_count(), 100 * BUFFER_SAMPLES as u64);
}
