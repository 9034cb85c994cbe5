//! # Timeout Timer Contract
//!
//! The master arms one timer per outstanding request and cancels it when
//! the response arrives. The facility is injected so embedders can bring
//! their own scheduler; [`TokioTimer`] is the stock implementation backed
//! by a spawned sleep task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// One-shot callback invoked on expiry, on a timer-owned thread
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle naming one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Timer collaborator of the master engine.
///
/// `arm` schedules `callback` to run once after `timeout`; `cancel` stops a
/// pending timer and reports whether it was still pending. A callback that
/// already fired cannot be cancelled.
pub trait TimeoutTimer: Send + Sync {
    /// Schedule a one-shot callback; `None` on scheduling failure
    fn arm(&self, timeout: Duration, callback: TimerCallback) -> Option<TimerHandle>;

    /// Cancel a pending timer; `false` if it already fired or is unknown
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Tokio-backed timer: each armed timeout is a spawned task sleeping on the
/// runtime, cancelled by aborting the task.
pub struct TokioTimer {
    runtime: tokio::runtime::Handle,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
}

impl TokioTimer {
    /// Create a timer on the current Tokio runtime.
    ///
    /// Panics outside a runtime context; use [`TokioTimer::with_handle`]
    /// when constructing from a non-runtime thread.
    pub fn new() -> Self {
        Self::with_handle(tokio::runtime::Handle::current())
    }

    /// Create a timer bound to an explicit runtime handle
    pub fn with_handle(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl TimeoutTimer for TokioTimer {
    fn arm(&self, timeout: Duration, callback: TimerCallback) -> Option<TimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            callback();
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, task);
        debug!(timer = id, ?timeout, "response timer armed");
        Some(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let Some(task) = self.tasks.lock().remove(&handle.0) else {
            return false;
        };
        if task.is_finished() {
            return false;
        }
        task.abort();
        debug!(timer = handle.0, "response timer cancelled");
        true
    }
}

/// Deterministic timer for tests and simulations: armed callbacks are held
/// until fired explicitly with [`ManualTimer::fire_next`].
#[derive(Default)]
pub struct ManualTimer {
    next_id: AtomicU64,
    pending: Mutex<Vec<(u64, TimerCallback)>>,
}

impl ManualTimer {
    /// Create a timer with no pending callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed callbacks not yet fired or cancelled
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fire the oldest pending callback; `false` when none is pending.
    ///
    /// The callback runs on the caller's thread with no timer lock held, so
    /// it may re-arm freely.
    pub fn fire_next(&self) -> bool {
        let next = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        (next.1)();
        true
    }
}

impl TimeoutTimer for ManualTimer {
    fn arm(&self, _timeout: Duration, callback: TimerCallback) -> Option<TimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.lock().push((id, callback));
        Some(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(id, _)| *id != handle.0);
        pending.len() != before
    }
}
