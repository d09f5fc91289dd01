//! Session-wide cooperative cancellation.
//!
//! One [`StopSignal`] is shared by every thread of a session. Stages poll
//! [`is_stopped`](StopSignal::is_stopped) at their queue and device boundaries; sleepers use
//! [`wait_timeout`](StopSignal::wait_timeout) so a stop wakes them immediately. The first
//! reason recorded wins, and so does the first fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `cancel()` was called
    Requested,
    /// The configured duration elapsed
    DurationElapsed,
    /// The overflow monitor reported sustained degradation
    Degraded,
    /// A stage failed
    Fault,
    /// Input was exhausted or the sample target reached
    Completed,
}

#[derive(Debug, Default)]
struct Inner {
    reason: Option<StopReason>,
    fault: Option<PipelineError>,
}

/// Shared stop flag with a first-writer-wins reason and fault slot.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl StopSignal {
    /// A signal in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns `true` if this call set the reason.
    pub fn stop(&self, reason: StopReason) -> bool {
        let mut inner = self.inner.lock();
        let first = inner.reason.is_none();
        if first {
            inner.reason = Some(reason);
            debug!(?reason, "Stop requested");
        }
        self.stopped.store(true, Ordering::Release);
        drop(inner);
        self.wake.notify_all();
        first
    }

    /// Record a fault and stop with [`StopReason::Fault`].
    ///
    /// Only the first fault is kept; later ones are usually consequences of it.
    pub fn fail(&self, error: PipelineError) {
        let mut inner = self.inner.lock();
        if inner.fault.is_none() {
            inner.fault = Some(error);
        } else {
            debug!(%error, "Secondary fault ignored");
        }
        if inner.reason.is_none() {
            inner.reason = Some(StopReason::Fault);
        }
        self.stopped.store(true, Ordering::Release);
        drop(inner);
        self.wake.notify_all();
    }

    /// Whether any stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The winning reason, if stopped.
    pub fn reason(&self) -> Option<StopReason> {
        self.inner.lock().reason
    }

    /// Whether a fault has been recorded.
    pub fn has_fault(&self) -> bool {
        self.inner.lock().fault.is_some()
    }

    /// Take the recorded fault.
    pub fn take_fault(&self) -> Option<PipelineError> {
        self.inner.lock().fault.take()
    }

    /// Sleep up to `timeout`, returning early (with `true`) once stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if !self.is_stopped() {
            let _ = self.wake.wait_for(&mut inner, timeout);
        }
        self.is_stopped()
    }
}
