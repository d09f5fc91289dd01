//! Bounded multi-producer/multi-consumer queue with an explicit overflow policy.
//!
//! This is the backpressure primitive between pipeline stages. Capture queues use
//! [`OverflowPolicy::DropOldest`] so the acquisition thread never waits; replay queues use
//! [`OverflowPolicy::Block`] so a fast reader simply stalls until the transmitter catches up.
//!
//! The queue never holds more than `capacity` items. `close()` is idempotent: consumers drain
//! what is left and then observe end-of-stream, blocked producers wake up and get their item
//! back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::pipeline::monitor::{OverflowMonitor, QueueProbe};

/// What `push` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest unconsumed item and hand it back to the producer
    DropOldest,
    /// Wait until a consumer makes room
    Block,
}

/// Returned by `push` on a closed queue; carries the rejected item.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

/// Outcome of [`BoundedSampleQueue::pop_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum PopTimeout<T> {
    /// An item was available
    Item(T),
    /// Nothing arrived before the deadline
    TimedOut,
    /// The queue is closed and drained
    Closed,
}

/// A run of consecutive items taken in one atomic step.
#[derive(Debug)]
pub struct Run<T> {
    /// Dense position of this run among all runs taken from the queue
    pub ordinal: u64,
    /// Items in FIFO order
    pub items: Vec<T>,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    next_ordinal: u64,
}

/// Fixed-capacity FIFO channel between two pipeline stages.
pub struct BoundedSampleQueue<T> {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    probe: Arc<QueueProbe>,
}

impl<T> BoundedSampleQueue<T> {
    /// Create a queue and register its probe with `monitor`.
    ///
    /// A zero capacity is raised to one.
    pub fn new(
        name: &str,
        capacity: usize,
        policy: OverflowPolicy,
        monitor: &OverflowMonitor,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.to_string(),
            capacity,
            policy,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                next_ordinal: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            probe: monitor.register_queue(name, capacity),
        }
    }

    /// Enqueue `item`.
    ///
    /// Under `DropOldest` a full queue evicts its head, which is returned as `Ok(Some(old))`.
    /// Under `Block` the call waits for room. On a closed queue the item comes back in
    /// `Err(QueueClosed(item))`.
    pub fn push(&self, item: T) -> Result<Option<T>, QueueClosed<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueClosed(item));
        }

        let mut displaced = None;
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    displaced = state.items.pop_front();
                    self.probe.on_drop();
                    trace!(queue = %self.name, "Queue full, dropped oldest item");
                }
                OverflowPolicy::Block => {
                    while state.items.len() >= self.capacity && !state.closed {
                        self.not_full.wait(&mut state);
                    }
                    if state.closed {
                        return Err(QueueClosed(item));
                    }
                }
            }
        }

        state.items.push_back(item);
        self.probe.on_push(state.items.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(displaced)
    }

    /// Dequeue one item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.probe.on_pop(1, state.items.len());
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> PopTimeout<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.probe.on_pop(1, state.items.len());
                drop(state);
                self.not_full.notify_one();
                return PopTimeout::Item(item);
            }
            if state.closed {
                return PopTimeout::Closed;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return if state.closed {
                    PopTimeout::Closed
                } else {
                    PopTimeout::TimedOut
                };
            }
        }
    }

    /// Take up to `max` consecutive items as one run and stamp it with the next ordinal.
    ///
    /// Waits until `max` items are queued, or the queue is closed with at least one item left.
    /// Because items are removed and the ordinal assigned under a single lock acquisition,
    /// every run is contiguous in FIFO order and ordinals are dense. Returns `None` once the
    /// queue is closed and drained.
    pub fn pop_run(&self, max: usize) -> Option<Run<T>> {
        let want = max.clamp(1, self.capacity);
        let mut state = self.state.lock();
        while state.items.len() < want && !state.closed {
            self.not_empty.wait(&mut state);
        }
        if state.items.is_empty() {
            return None;
        }

        let take = want.min(state.items.len());
        let items: Vec<T> = state.items.drain(..take).collect();
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        self.probe.on_pop(items.len(), state.items.len());
        drop(state);
        self.not_full.notify_all();
        Some(Run { ordinal, items })
    }

    /// Wait until at least `depth` items are queued, the queue closes, or `timeout` passes.
    ///
    /// Returns the depth observed on return. Intended for a single consumer priming itself.
    pub fn wait_for_depth(&self, depth: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.len() < depth && !state.closed {
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.items.len()
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            trace!(queue = %self.name, remaining = state.items.len(), "Queue closed");
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Queue name as registered with the monitor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Occupancy counters.
    pub fn probe(&self) -> &QueueProbe {
        &self.probe
    }
}

impl<T> std::fmt::Debug for BoundedSampleQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedSampleQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn queue(capacity: usize, policy: OverflowPolicy) -> (Arc<OverflowMonitor>, BoundedSampleQueue<u64>) {
        let monitor = Arc::new(OverflowMonitor::default());
        let q = BoundedSampleQueue::new("test", capacity, policy, &monitor);
        (monitor, q)
    }

    #[test]
    fn test_fifo_order() {
        let (_m, q) = queue(4, OverflowPolicy::Block);
        for i in 0..4 {
            assert_eq!(q.push(i).unwrap(), None);
        }
        assert_eq!(q.len(), 4);
        for i in 0..4 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_drop_oldest_never_exceeds_capacity() {
        let (monitor, q) = queue(3, OverflowPolicy::DropOldest);
        let mut displaced = Vec::new();
        for i in 0..10 {
            if let Some(old) = q.push(i).unwrap() {
                displaced.push(old);
            }
            assert!(q.len() <= q.capacity());
        }
        assert_eq!(displaced, (0..7).collect::<Vec<_>>());
        assert_eq!(q.probe().dropped(), 7);
        assert_eq!(q.probe().high_water(), 3);
        assert_eq!(monitor.snapshot().queue("test").unwrap().dropped, 7);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let (_m, q) = queue(4, OverflowPolicy::Block);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.close();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.push(3), Err(QueueClosed(3)));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let monitor = OverflowMonitor::default();
        let q = Arc::new(BoundedSampleQueue::<u64>::new(
            "wake",
            2,
            OverflowPolicy::Block,
            &monitor,
        ));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_block_policy_waits_for_room() {
        let monitor = OverflowMonitor::default();
        let q = Arc::new(BoundedSampleQueue::new(
            "block",
            1,
            OverflowPolicy::Block,
            &monitor,
        ));
        q.push(0u64).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(1).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(producer.join().unwrap(), None);
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let monitor = OverflowMonitor::default();
        let q = Arc::new(BoundedSampleQueue::new(
            "release",
            1,
            OverflowPolicy::Block,
            &monitor,
        ));
        q.push(0u64).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(9))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(producer.join().unwrap(), Err(QueueClosed(9)));
    }

    #[test]
    fn test_pop_timeout() {
        let (_m, q) = queue(2, OverflowPolicy::Block);
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), PopTimeout::TimedOut);
        q.push(7).unwrap();
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), PopTimeout::Item(7));
        q.close();
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), PopTimeout::Closed);
    }

    #[test]
    fn test_pop_run_assigns_dense_ordinals() {
        let (_m, q) = queue(16, OverflowPolicy::DropOldest);
        for i in 0..10 {
            q.push(i).unwrap();
        }
        q.close();

        let a = q.pop_run(4).unwrap();
        let b = q.pop_run(4).unwrap();
        let c = q.pop_run(4).unwrap();
        assert!(q.pop_run(4).is_none());

        assert_eq!((a.ordinal, a.items), (0, vec![0, 1, 2, 3]));
        assert_eq!((b.ordinal, b.items), (1, vec![4, 5, 6, 7]));
        // Final partial run is released by close.
        assert_eq!((c.ordinal, c.items), (2, vec![8, 9]));
    }

    #[test]
    fn test_pop_run_waits_for_full_run() {
        let monitor = OverflowMonitor::default();
        let q = Arc::new(BoundedSampleQueue::new(
            "run",
            8,
            OverflowPolicy::DropOldest,
            &monitor,
        ));
        q.push(0u64).unwrap();
        let worker = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_run(3))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(1).unwrap();
        q.push(2).unwrap();
        let run = worker.join().unwrap().unwrap();
        assert_eq!(run.items, vec![0, 1, 2]);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let monitor = OverflowMonitor::default();
        let q = Arc::new(BoundedSampleQueue::new(
            "mpmc",
            8,
            OverflowPolicy::Block,
            &monitor,
        ));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(v) = q.pop() {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        q.close();
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all.len(), 1000);
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert!(q.probe().high_water() <= 8);
    }
}
