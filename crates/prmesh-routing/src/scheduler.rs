//! One-shot update timers
//!
//! A scheduled callback fires at most once, no earlier than its interval.
//! Periodic behaviour is the callback's job: it re-arms itself. Cancelling
//! and firing race on removing the timer from the pending set, so a cancel
//! that lands first always wins.

use crate::error::{Result, RoutingError};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle for a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Callback run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot callbacks
pub trait UpdateScheduler: Send + Sync {
    /// Run `callback` once, no earlier than `interval` from now
    fn schedule(&self, interval: Duration, callback: TimerCallback) -> Result<TimerId>;

    /// Cancel a pending timer
    ///
    /// Returns `false` when the timer already fired or was never scheduled.
    fn cancel(&self, id: TimerId) -> bool;
}

/// Real timers on a tokio runtime
pub struct TokioScheduler {
    handle: Option<Handle>,
    next_id: AtomicU64,
    /// Timers that have neither fired nor been cancelled
    armed: Arc<DashMap<TimerId, ()>>,
    tasks: DashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    /// Bind to the runtime of the calling context, if any
    ///
    /// Without a runtime every `schedule` call fails with
    /// `SchedulerUnavailable` unless one is reachable at that point.
    pub fn new() -> Self {
        Self::from_handle(Handle::try_current().ok())
    }

    /// Bind to an explicit runtime
    pub fn with_handle(handle: Handle) -> Self {
        Self::from_handle(Some(handle))
    }

    fn from_handle(handle: Option<Handle>) -> Self {
        TokioScheduler {
            handle,
            next_id: AtomicU64::new(1),
            armed: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
        }
    }

    /// Number of timers still waiting to fire
    pub fn pending(&self) -> usize {
        self.armed.len()
    }

    fn runtime(&self) -> Result<Handle> {
        match &self.handle {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current()
                .map_err(|e| RoutingError::SchedulerUnavailable(e.to_string())),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateScheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, callback: TimerCallback) -> Result<TimerId> {
        let runtime = self.runtime()?;
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // Forget handles of timers that already ran
        self.tasks.retain(|_, task| !task.is_finished());

        self.armed.insert(id, ());
        let armed = Arc::clone(&self.armed);
        let task = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if armed.remove(&id).is_some() {
                callback();
            }
        });
        self.tasks.insert(id, task);

        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> bool {
        let won = self.armed.remove(&id).is_some();
        if let Some((_, task)) = self.tasks.remove(&id) {
            if won {
                task.abort();
            }
        }
        trace!("Cancel timer {}: {}", id.0, if won { "cancelled" } else { "already fired" });
        won
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.armed.clear();
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}

struct VirtualState {
    now: Duration,
    next_id: u64,
    queue: BinaryHeap<Reverse<(Duration, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
}

/// Discrete-event scheduler driven by a virtual clock
///
/// Nothing fires until the clock is advanced. Events fire in due-time order,
/// ties broken by scheduling order, and callbacks may schedule new events.
pub struct VirtualScheduler {
    state: Mutex<VirtualState>,
}

impl VirtualScheduler {
    /// Create a scheduler whose clock starts at zero
    pub fn new() -> Self {
        VirtualScheduler {
            state: Mutex::new(VirtualState {
                now: Duration::ZERO,
                next_id: 1,
                queue: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of timers still waiting to fire
    pub fn pending(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Due time of the earliest pending timer
    pub fn next_due(&self) -> Option<Duration> {
        let mut state = self.lock();
        while let Some(Reverse((due, id))) = state.queue.peek().copied() {
            if state.callbacks.contains_key(&id) {
                return Some(due);
            }
            state.queue.pop();
        }
        None
    }

    /// Advance the clock by `by`, firing everything that falls due
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = self.now() + by;
        self.run_until(deadline)
    }

    /// Fire every timer due at or before `deadline`, then set the clock to it
    ///
    /// Returns the number of callbacks run. The lock is released while a
    /// callback runs so it can schedule or cancel timers.
    pub fn run_until(&self, deadline: Duration) -> usize {
        let mut fired = 0;

        loop {
            let callback = {
                let mut state = self.lock();
                match state.queue.peek().copied() {
                    Some(Reverse((due, id))) if due <= deadline => {
                        state.queue.pop();
                        match state.callbacks.remove(&id) {
                            Some(callback) => {
                                state.now = state.now.max(due);
                                callback
                            }
                            // Cancelled
                            None => continue,
                        }
                    }
                    _ => {
                        state.now = state.now.max(deadline);
                        break;
                    }
                }
            };

            callback();
            fired += 1;
        }

        fired
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateScheduler for VirtualScheduler {
    fn schedule(&self, interval: Duration, callback: TimerCallback) -> Result<TimerId> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let due = state.now + interval;
        state.queue.push(Reverse((due, id)));
        state.callbacks.insert(id, callback);

        Ok(TimerId(id))
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.lock().callbacks.remove(&id.0).is_some()
    }
}
