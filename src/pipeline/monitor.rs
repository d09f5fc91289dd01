//! Overflow monitor and pipeline statistics.
//!
//! The monitor is a passive observer. Every stage registers a set of counters with it and
//! updates them with relaxed atomic increments; nothing on the hot path takes a lock. A read
//! ([`OverflowMonitor::snapshot`]) aggregates all registered counters into a [`PipelineStats`].
//!
//! Overflow-type events (queue drops, device overruns, device underruns) are additionally
//! counted in a bucketed sliding window which backs [`OverflowMonitor::degraded`]. The monitor
//! never acts on that predicate itself; aborting is the session controller's decision.
//!
//! # Sliding window
//!
//! The window is split into [`WINDOW_BUCKETS`] time buckets. Each bucket remembers which time
//! slot it currently counts for and is reset lazily when an event lands in a newer slot. Under
//! heavy contention an event recorded exactly while its bucket is being recycled can be lost;
//! the window is an approximate rate signal, the per-kind totals are exact.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::SequenceRange;

/// Number of buckets in the sliding event window.
pub const WINDOW_BUCKETS: usize = 10;

/// Kind of overflow-type event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowKind {
    /// A capture queue displaced its oldest buffer
    QueueDrop,
    /// The device lost samples on receive
    DeviceOverrun,
    /// The device ran dry on transmit
    DeviceUnderrun,
}

/// Threshold above which the pipeline counts as degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedThreshold {
    /// More than this many events inside `window` means degraded
    pub max_events: u64,
    /// Width of the sliding window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for DegradedThreshold {
    fn default() -> Self {
        Self {
            max_events: 50,
            window: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Per-stage counters
// =============================================================================

/// Counters owned by the device-driving thread.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    buffers: AtomicU64,
    samples: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
    timeouts: AtomicU64,
}

impl DeviceCounters {
    /// A buffer of `samples` moved across the device boundary.
    pub fn record_buffer(&self, samples: u64) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples, Ordering::Relaxed);
    }

    /// A receive call timed out without data.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters owned by one processing stage (worker pool, writer, reader, transmitter).
#[derive(Debug, Default)]
pub struct StageCounters {
    name: String,
    units_in: AtomicU64,
    units_out: AtomicU64,
    samples: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl StageCounters {
    /// A unit of `bytes` entered the stage.
    pub fn record_in(&self, bytes: u64) {
        self.units_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A unit carrying `samples` complex samples and `bytes` left the stage.
    pub fn record_out(&self, samples: u64, bytes: u64) {
        self.units_out.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Samples that have left this stage.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            units_in: self.units_in.load(Ordering::Relaxed),
            units_out: self.units_out.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Occupancy counters for one bounded queue.
#[derive(Debug)]
pub struct QueueProbe {
    name: String,
    capacity: usize,
    depth: AtomicUsize,
    high_water: AtomicUsize,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl QueueProbe {
    pub(crate) fn on_push(&self, depth: usize) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.depth.store(depth, Ordering::Relaxed);
        self.high_water.fetch_max(depth, Ordering::Relaxed);
    }

    pub(crate) fn on_pop(&self, count: usize, depth: usize) {
        self.popped.fetch_add(count as u64, Ordering::Relaxed);
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn on_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Items displaced by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deepest occupancy observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            capacity: self.capacity,
            depth: self.depth.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

/// Device-side totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Buffers read or written
    pub buffers: u64,
    /// Complex samples read or written
    pub samples: u64,
    /// Receive overruns reported by the device
    pub overruns: u64,
    /// Transmit underruns reported by the device
    pub underruns: u64,
    /// Receive timeouts
    pub timeouts: u64,
}

/// Totals for one processing stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage name
    pub name: String,
    /// Units taken from the input
    pub units_in: u64,
    /// Units handed downstream
    pub units_out: u64,
    /// Complex samples handed downstream
    pub samples: u64,
    /// Bytes taken from the input
    pub bytes_in: u64,
    /// Bytes handed downstream
    pub bytes_out: u64,
}

/// Occupancy of one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name
    pub name: String,
    /// Configured capacity
    pub capacity: usize,
    /// Depth at the time of the snapshot
    pub depth: usize,
    /// Deepest occupancy observed
    pub high_water: usize,
    /// Items accepted
    pub pushed: u64,
    /// Items handed to consumers
    pub popped: u64,
    /// Items displaced by drop-oldest
    pub dropped: u64,
}

/// Aggregated view of every stage's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Seconds since the monitor was created
    pub elapsed_secs: f64,
    /// Device totals
    pub device: DeviceStats,
    /// Per-stage totals
    pub stages: Vec<StageStats>,
    /// Per-queue occupancy
    pub queues: Vec<QueueStats>,
    /// Queue drops + overruns + underruns
    pub overflow_events: u64,
    /// Sequence ranges skipped during replay
    pub gaps: u64,
    /// Chunks that failed checksum verification
    pub checksum_failures: u64,
    /// Whether the degraded threshold was exceeded at snapshot time
    pub degraded: bool,
}

impl PipelineStats {
    /// Look up a queue by name.
    pub fn queue(&self, name: &str) -> Option<&QueueStats> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Total items dropped across all queues.
    pub fn dropped(&self) -> u64 {
        self.queues.iter().map(|q| q.dropped).sum()
    }
}

// =============================================================================
// Sliding window
// =============================================================================

#[derive(Debug)]
struct EventWindow {
    bucket_ms: u64,
    slots: [AtomicU64; WINDOW_BUCKETS],
    counts: [AtomicU64; WINDOW_BUCKETS],
}

impl EventWindow {
    fn new(window: Duration) -> Self {
        let bucket_ms = (window.as_millis() as u64 / WINDOW_BUCKETS as u64).max(1);
        Self {
            bucket_ms,
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn slot_at(&self, elapsed: Duration) -> u64 {
        elapsed.as_millis() as u64 / self.bucket_ms
    }

    fn record(&self, elapsed: Duration) {
        let slot = self.slot_at(elapsed);
        let idx = (slot % WINDOW_BUCKETS as u64) as usize;
        let seen = self.slots[idx].load(Ordering::Acquire);
        if seen != slot
            && self.slots[idx]
                .compare_exchange(seen, slot, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.counts[idx].store(0, Ordering::Release);
        }
        self.counts[idx].fetch_add(1, Ordering::AcqRel);
    }

    fn total(&self, elapsed: Duration) -> u64 {
        let now = self.slot_at(elapsed);
        (0..WINDOW_BUCKETS)
            .filter(|&i| {
                let slot = self.slots[i].load(Ordering::Acquire);
                slot <= now && now - slot < WINDOW_BUCKETS as u64
            })
            .map(|i| self.counts[i].load(Ordering::Acquire))
            .sum()
    }
}

// =============================================================================
// Warning throttle
// =============================================================================

/// Limits a repeated warning to one line per interval on the hot path.
#[derive(Debug)]
pub struct WarnThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnThrottle {
    /// At most one warning per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` when a warning may be logged now, counting this event.
    pub fn ready(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

// =============================================================================
// OverflowMonitor
// =============================================================================

/// Session-wide accounting of queue occupancy and overflow-type events.
#[derive(Debug)]
pub struct OverflowMonitor {
    started: Instant,
    threshold: DegradedThreshold,
    window: EventWindow,
    device: Arc<DeviceCounters>,
    stages: RwLock<Vec<Arc<StageCounters>>>,
    queues: RwLock<Vec<Arc<QueueProbe>>>,
    skipped: Mutex<Vec<SequenceRange>>,
    checksum_failures: AtomicU64,
}

impl OverflowMonitor {
    /// Create a monitor with the given degraded threshold.
    pub fn new(threshold: DegradedThreshold) -> Self {
        Self {
            started: Instant::now(),
            window: EventWindow::new(threshold.window),
            threshold,
            device: Arc::new(DeviceCounters::default()),
            stages: RwLock::new(Vec::new()),
            queues: RwLock::new(Vec::new()),
            skipped: Mutex::new(Vec::new()),
            checksum_failures: AtomicU64::new(0),
        }
    }

    /// Register a queue; the returned probe is updated by the queue itself.
    pub fn register_queue(&self, name: &str, capacity: usize) -> Arc<QueueProbe> {
        let probe = Arc::new(QueueProbe {
            name: name.to_string(),
            capacity,
            depth: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        self.queues.write().push(Arc::clone(&probe));
        probe
    }

    /// Register a processing stage.
    pub fn register_stage(&self, name: &str) -> Arc<StageCounters> {
        let counters = Arc::new(StageCounters {
            name: name.to_string(),
            ..Default::default()
        });
        self.stages.write().push(Arc::clone(&counters));
        counters
    }

    /// Counters for the device-driving thread.
    pub fn device(&self) -> Arc<DeviceCounters> {
        Arc::clone(&self.device)
    }

    /// Account one overflow-type event.
    pub fn record_overflow(&self, kind: OverflowKind) {
        match kind {
            // The queue's own probe already counted the drop.
            OverflowKind::QueueDrop => {}
            OverflowKind::DeviceOverrun => {
                self.device.overruns.fetch_add(1, Ordering::Relaxed);
            }
            OverflowKind::DeviceUnderrun => {
                self.device.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.window.record(self.started.elapsed());
    }

    /// Account a sequence range skipped on replay, whether missing from the index or dropped
    /// after failing verification.
    pub fn record_gap(&self, range: SequenceRange) {
        self.skipped.lock().push(range);
    }

    /// Every skipped range so far, in sequence order.
    pub fn skipped_ranges(&self) -> Vec<SequenceRange> {
        let mut ranges = self.skipped.lock().clone();
        ranges.sort_by_key(|r| r.start);
        ranges
    }

    /// Account a chunk whose checksum did not verify.
    pub fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Overflow-type events currently inside the sliding window.
    pub fn events_in_window(&self) -> u64 {
        self.window.total(self.started.elapsed())
    }

    /// The configured threshold.
    pub fn threshold(&self) -> DegradedThreshold {
        self.threshold
    }

    /// True while the event rate exceeds the configured threshold.
    pub fn degraded(&self) -> bool {
        self.events_in_window() > self.threshold.max_events
    }

    /// Total overflow-type events since creation.
    pub fn overflow_events(&self) -> u64 {
        let drops: u64 = self.queues.read().iter().map(|q| q.dropped()).sum();
        drops
            + self.device.overruns.load(Ordering::Relaxed)
            + self.device.underruns.load(Ordering::Relaxed)
    }

    /// Aggregate every registered counter.
    pub fn snapshot(&self) -> PipelineStats {
        let device = DeviceStats {
            buffers: self.device.buffers.load(Ordering::Relaxed),
            samples: self.device.samples.load(Ordering::Relaxed),
            overruns: self.device.overruns.load(Ordering::Relaxed),
            underruns: self.device.underruns.load(Ordering::Relaxed),
            timeouts: self.device.timeouts.load(Ordering::Relaxed),
        };
        let queues: Vec<QueueStats> = self.queues.read().iter().map(|q| q.snapshot()).collect();
        let dropped: u64 = queues.iter().map(|q| q.dropped).sum();

        PipelineStats {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            overflow_events: dropped + device.overruns + device.underruns,
            device,
            stages: self.stages.read().iter().map(|s| s.snapshot()).collect(),
            queues,
            gaps: self.skipped.lock().len() as u64,
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            degraded: self.degraded(),
        }
    }
}

impl Default for OverflowMonitor {
    fn default() -> Self {
        Self::new(DegradedThreshold::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_counters_aggregate() {
        let monitor = OverflowMonitor::default();
        let writer = monitor.register_stage("writer");
        writer.record_in(100);
        writer.record_out(64, 40);
        writer.record_out(64, 42);

        let stats = monitor.snapshot();
        let stage = stats.stage("writer").unwrap();
        assert_eq!(stage.units_in, 1);
        assert_eq!(stage.units_out, 2);
        assert_eq!(stage.samples, 128);
        assert_eq!(stage.bytes_out, 82);
    }

    #[test]
    fn test_queue_probe_high_water() {
        let monitor = OverflowMonitor::default();
        let probe = monitor.register_queue("raw", 4);
        probe.on_push(1);
        probe.on_push(2);
        probe.on_pop(1, 1);
        probe.on_push(2);
        probe.on_drop();

        let stats = monitor.snapshot();
        let q = stats.queue("raw").unwrap();
        assert_eq!(q.capacity, 4);
        assert_eq!(q.high_water, 2);
        assert_eq!(q.pushed, 3);
        assert_eq!(q.popped, 1);
        assert_eq!(q.dropped, 1);
        assert_eq!(stats.overflow_events, 1);
    }

    #[test]
    fn test_degraded_threshold() {
        let monitor = OverflowMonitor::new(DegradedThreshold {
            max_events: 3,
            window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            monitor.record_overflow(OverflowKind::DeviceOverrun);
        }
        assert!(!monitor.degraded());
        monitor.record_overflow(OverflowKind::DeviceUnderrun);
        assert!(monitor.degraded());

        let stats = monitor.snapshot();
        assert_eq!(stats.device.overruns, 3);
        assert_eq!(stats.device.underruns, 1);
        assert!(stats.degraded);
    }

    #[test]
    fn test_window_forgets_old_events() {
        let window = EventWindow::new(Duration::from_millis(100));
        window.record(Duration::from_millis(5));
        window.record(Duration::from_millis(15));
        assert_eq!(window.total(Duration::from_millis(20)), 2);
        // Both events are more than one window old.
        assert_eq!(window.total(Duration::from_millis(500)), 0);
        // Recycling a bucket resets its count.
        window.record(Duration::from_millis(505));
        assert_eq!(window.total(Duration::from_millis(505)), 1);
    }

    #[test]
    fn test_warn_throttle() {
        let mut throttle = WarnThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.ready(), Some(0));
        assert_eq!(throttle.ready(), None);
        assert_eq!(throttle.ready(), None);
        throttle.last = Some(Instant::now() - Duration::from_secs(61));
        assert_eq!(throttle.ready(), Some(2));
    }

    #[test]
    fn test_gap_and_checksum_counters() {
        let monitor = OverflowMonitor::default();
        monitor.record_gap(SequenceRange::new(8, 9));
        monitor.record_gap(SequenceRange::new(3, 4));
        monitor.record_checksum_failure();
        let stats = monitor.snapshot();
        assert_eq!(stats.gaps, 2);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(
            monitor.skipped_ranges(),
            vec![SequenceRange::new(3, 4), SequenceRange::new(8, 9)]
        );
    }
}
