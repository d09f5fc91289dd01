//! Re-sequencing at the boundary between a parallel worker pool and an ordered consumer.
//!
//! Workers finish chunks in any order. [`ReorderWindow`] holds completed units keyed by their
//! ordinal and releases them only when every lower ordinal has been released. [`Sequencer`]
//! wraps a window so that a pool of threads can feed it concurrently and pushes the released
//! items into the downstream queue in order.
//!
//! The window span bounds how far ahead of the slowest outstanding unit a worker may run. A
//! worker whose ordinal is beyond the span waits, which in turn bounds memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

use crate::pipeline::queue::BoundedSampleQueue;

/// Rejected insertions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReorderError {
    /// Ordinal was already released or already pending
    #[error("Ordinal {ordinal} was already submitted")]
    Duplicate { ordinal: u64 },

    /// Ordinal is further ahead than the window span allows
    #[error("Ordinal {ordinal} is outside the window starting at {next} (span {span})")]
    OutOfWindow { ordinal: u64, next: u64, span: usize },

    /// Downstream queue is closed
    #[error("Sequencer output is closed")]
    Closed,
}

/// Bounded reorder buffer keyed by expected-next ordinal.
#[derive(Debug)]
pub struct ReorderWindow<T> {
    next: u64,
    span: usize,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> ReorderWindow<T> {
    /// Window accepting ordinals `0..span` initially.
    pub fn new(span: usize) -> Self {
        Self {
            next: 0,
            span: span.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Ordinal the window will release next.
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Whether `ordinal` fits in the current window.
    pub fn accepts(&self, ordinal: u64) -> bool {
        ordinal >= self.next && ordinal - self.next < self.span as u64
    }

    /// Store a completed unit.
    pub fn insert(&mut self, ordinal: u64, item: T) -> Result<(), ReorderError> {
        self.place(ordinal, Some(item))
    }

    /// Mark `ordinal` as a hole that releases nothing.
    pub fn skip(&mut self, ordinal: u64) -> Result<(), ReorderError> {
        self.place(ordinal, None)
    }

    fn place(&mut self, ordinal: u64, slot: Option<T>) -> Result<(), ReorderError> {
        if ordinal < self.next || self.pending.contains_key(&ordinal) {
            return Err(ReorderError::Duplicate { ordinal });
        }
        if !self.accepts(ordinal) {
            return Err(ReorderError::OutOfWindow {
                ordinal,
                next: self.next,
                span: self.span,
            });
        }
        self.pending.insert(ordinal, slot);
        Ok(())
    }

    /// Release the next unit if it is present.
    ///
    /// Returns `(ordinal, None)` for a skipped hole.
    pub fn pop_ready(&mut self) -> Option<(u64, Option<T>)> {
        let slot = self.pending.remove(&self.next)?;
        let ordinal = self.next;
        self.next += 1;
        Some((ordinal, slot))
    }

    /// Units held back waiting for a lower ordinal.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Configured span.
    pub fn span(&self) -> usize {
        self.span
    }
}

/// Thread-safe ordered hand-off from a worker pool to a downstream queue.
///
/// Each worker submits a `Vec<T>` per ordinal (a decompressed chunk may expand into several
/// buffers). The output queue is closed when the last registered producer calls
/// [`finish`](Self::finish).
pub struct Sequencer<T> {
    window: Mutex<ReorderWindow<Vec<T>>>,
    space: Condvar,
    output: Arc<BoundedSampleQueue<T>>,
    producers: AtomicUsize,
}

impl<T> Sequencer<T> {
    /// Sequencer feeding `output`, expecting `producers` calls to `finish`.
    pub fn new(output: Arc<BoundedSampleQueue<T>>, span: usize, producers: usize) -> Self {
        Self {
            window: Mutex::new(ReorderWindow::new(span)),
            space: Condvar::new(),
            output,
            producers: AtomicUsize::new(producers),
        }
    }

    /// Submit the items produced for `ordinal`.
    ///
    /// Blocks while `ordinal` is beyond the window. Everything that becomes releasable is
    /// pushed downstream before returning.
    pub fn submit(&self, ordinal: u64, items: Vec<T>) -> Result<(), ReorderError> {
        self.place(ordinal, Some(items))
    }

    /// Declare `ordinal` produced nothing.
    pub fn skip(&self, ordinal: u64) -> Result<(), ReorderError> {
        self.place(ordinal, None)
    }

    fn place(&self, ordinal: u64, items: Option<Vec<T>>) -> Result<(), ReorderError> {
        let mut window = self.window.lock();
        while ordinal >= window.next_expected() && !window.accepts(ordinal) {
            if self.output.is_closed() {
                return Err(ReorderError::Closed);
            }
            self.space
                .wait_for(&mut window, Duration::from_millis(50));
        }
        match items {
            Some(items) => window.insert(ordinal, items)?,
            None => window.skip(ordinal)?,
        }

        let mut released = false;
        while let Some((ready, slot)) = window.pop_ready() {
            released = true;
            let Some(items) = slot else {
                trace!(ordinal = ready, "Skipped hole in sequence");
                continue;
            };
            for item in items {
                // Holding the window lock here keeps pushes in ordinal order across workers.
                self.output.push(item).map_err(|_| ReorderError::Closed)?;
            }
        }
        drop(window);
        if released {
            self.space.notify_all();
        }
        Ok(())
    }

    /// Ordinal the sequencer will release next.
    pub fn next_expected(&self) -> u64 {
        self.window.lock().next_expected()
    }

    /// A producer is done. The last one closes the output queue.
    pub fn finish(&self) {
        if self.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let window = self.window.lock();
            if window.pending_len() > 0 {
                trace!(
                    pending = window.pending_len(),
                    next = window.next_expected(),
                    "Sequencer finished with unreleased units"
                );
            }
            drop(window);
            self.output.close();
            self.space.notify_all();
        }
    }

    /// Close the output immediately and wake any waiting producer.
    pub fn abort(&self) {
        self.output.close();
        self.space.notify_all();
    }
}

/// Calls [`Sequencer::finish`] when dropped, so a worker that exits by any path (including
/// a panic) still counts itself out.
pub struct ProducerGuard<T> {
    sequencer: Arc<Sequencer<T>>,
}

impl<T> ProducerGuard<T> {
    /// Guard for one producer of `sequencer`.
    pub fn new(sequencer: Arc<Sequencer<T>>) -> Self {
        Self { sequencer }
    }
}

impl<T> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        self.sequencer.finish();
    }
}
