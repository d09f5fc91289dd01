//! Checksum verification, gap handling and index recovery on replay.

mod common;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use common::*;
use rf_recorder::config::GapPolicy;
use rf_recorder::core::SequenceRange;
use rf_recorder::data::chunk_file::{ChunkReader, IndexRecord, SessionPaths};
use rf_recorder::data::metadata::SessionStatus;
use rf_recorder::PipelineError;
use tempfile::TempDir;

const BUFFER: usize = 1024;

/// Flip one byte in the middle of `record`'s payload.
fn corrupt(paths: &SessionPaths, record: &IndexRecord) {
    let mut data = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&paths.data)
        .expect("open data file");
    let offset = record.byte_offset + record.byte_length / 2;
    let mut byte = [0u8; 1];
    data.seek(SeekFrom::Start(offset)).expect("seek");
    data.read_exact(&mut byte).expect("read");
    data.seek(SeekFrom::Start(offset)).expect("seek");
    data.write_all(&[byte[0] ^ 0xFF]).expect("write");
}

fn corrupted_recording(dir: &TempDir) -> (SessionPaths, IndexRecord) {
    let base = write_recording(&dir.path().join("corrupt"), &[(0, 3), (4, 7), (8, 11)], BUFFER);
    let paths = SessionPaths::new(base);
    let victim = ChunkReader::open(paths.clone()).expect("index opens").records()[1];
    corrupt(&paths, &victim);
    (paths, victim)
}

#[test]
fn test_verify_detects_corruption() {
    let dir = TempDir::new().expect("tempdir");
    let (paths, victim) = corrupted_recording(&dir);

    let report = ChunkReader::open(paths)
        .expect("index opens")
        .verify()
        .expect("verify");
    assert!(!report.is_clean());
    assert_eq!(report.corrupt, vec![victim.range]);
    assert_eq!(report.valid_samples, 8 * BUFFER as u64);
}

#[test]
fn test_corrupt_chunk_aborts_replay() {
    let dir = TempDir::new().expect("tempdir");
    let (paths, victim) = corrupted_recording(&dir);

    let (outcome, probe) = replay_to_memory(&paths.base, replay_config(GapPolicy::Abort, 2));
    let failure = outcome.expect_err("corruption must fail the replay");

    assert!(matches!(
        failure.error,
        PipelineError::ChecksumMismatch { range, .. } if range == victim.range
    ));
    assert_eq!(failure.report.metadata.status, SessionStatus::Failed);
    assert_eq!(failure.report.stats.checksum_failures, 1);
    // Nothing from or after the corrupt chunk reached the device.
    assert!(probe.sequences().iter().all(|&s| s < victim.range.start));
}

#[test]
fn test_corrupt_chunk_skipped_on_request() {
    let dir = TempDir::new().expect("tempdir");
    let (paths, victim) = corrupted_recording(&dir);

    let (outcome, probe) = replay_to_memory(&paths.base, replay_config(GapPolicy::Skip, 2));
    let report = outcome.expect("skip policy continues");

    assert_eq!(report.stats.checksum_failures, 1);
    assert_eq!(report.stats.gaps, 1);
    assert_eq!(report.skipped, vec![victim.range]);
    let sent: Vec<u64> = (0..4).chain(8..12).collect();
    assert_eq!(probe.sequences(), sent);
    assert_eq!(probe.samples(), expected_samples(sent, BUFFER));
}

#[test]
fn test_skipped_ranges_cover_gaps_and_corrupt_chunks() {
    let dir = TempDir::new().expect("tempdir");
    let base = write_recording(
        &dir.path().join("mixed"),
        &[(0, 3), (4, 7), (12, 15)],
        BUFFER,
    );
    let paths = SessionPaths::new(base);
    let victim = ChunkReader::open(paths.clone()).expect("index opens").records()[1];
    corrupt(&paths, &victim);

    let (outcome, probe) = replay_to_memory(&paths.base, replay_config(GapPolicy::Skip, 2));
    let report = outcome.expect("skip policy continues");

    assert_eq!(
        report.skipped,
        vec![SequenceRange::new(4, 7), SequenceRange::new(8, 11)]
    );
    assert_eq!(report.stats.gaps, 2);
    let sent: Vec<u64> = (0..4).chain(12..16).collect();
    assert_eq!(probe.sequences(), sent);
    assert_eq!(report.samples(), sent.len() as u64 * BUFFER as u64);
}

#[test]
fn test_missing_range_aborts_replay() {
    let dir = TempDir::new().expect("tempdir");
    let base = write_recording(&dir.path().join("gappy"), &[(0, 3), (8, 11)], BUFFER);

    let (outcome, probe) = replay_to_memory(&base, replay_config(GapPolicy::Abort, 2));
    let failure = outcome.expect_err("gap must fail the replay");
    assert!(matches!(
        failure.error,
        PipelineError::Gap { missing } if missing == SequenceRange::new(4, 7)
    ));
    assert!(probe.sequences().iter().all(|&s| s < 4));
}

#[test]
fn test_missing_range_skipped_on_request() {
    let dir = TempDir::new().expect("tempdir");
    let base = write_recording(&dir.path().join("gappy"), &[(0, 3), (8, 11)], BUFFER);

    let (outcome, probe) = replay_to_memory(&base, replay_config(GapPolicy::Skip, 2));
    let report = outcome.expect("skip policy continues");

    assert_eq!(report.skipped, vec![SequenceRange::new(4, 7)]);
    let sent: Vec<u64> = (0..4).chain(8..12).collect();
    assert_eq!(probe.sequences(), sent);
    assert_eq!(probe.samples(), expected_samples(sent, BUFFER));
}

#[test]
fn test_trailing_partial_index_record_is_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let base = write_recording(&dir.path().join("torn"), &[(0, 3), (4, 7)], BUFFER);
    let paths = SessionPaths::new(&base);
    let mut index = OpenOptions::new()
        .append(true)
        .open(&paths.index)
        .expect("open index");
    index.write_all(&[0x5A; 40]).expect("append torn record");
    drop(index);

    let (outcome, probe) = replay_to_memory(&base, replay_config(GapPolicy::Abort, 1));
    outcome.expect("torn tail is tolerated");
    assert_eq!(probe.sequences(), (0..8).collect::<Vec<_>>());
}
