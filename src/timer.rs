//! Logical-time timer queue
//!
//! Timers fire against the scheduler's clock watermark, never wall time, so
//! replayed captures expire fragments and streams at the same points a live
//! run would. Callbacks run outside the queue lock; a callback is free to
//! requeue or cancel its own timer.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::Timestamp;

type TimerCallback = Box<dyn FnMut(Timestamp) + Send>;

struct Timer {
    /// Micros since epoch; `None` while dequeued
    deadline: Option<i64>,
    /// Taken out while firing so the callback can touch the queue
    cb: Option<TimerCallback>,
}

#[derive(Default)]
struct TimerQueueInner {
    timers: HashMap<u64, Timer>,
    /// Deadline-ordered index over queued timers
    by_deadline: BTreeSet<(i64, u64)>,
}

/// Identifies a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Queue of logical-time timers, driven by `run_expired`
#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<TimerQueueInner>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a callback and queue it for `deadline`
    pub fn schedule<F>(&self, deadline: Timestamp, cb: F) -> TimerHandle
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let micros = deadline.timestamp_micros();
        let mut inner = self.inner.lock();
        inner.timers.insert(
            id,
            Timer {
                deadline: Some(micros),
                cb: Some(Box::new(cb)),
            },
        );
        inner.by_deadline.insert((micros, id));
        TimerHandle(id)
    }

    /// Move an existing timer to a new deadline. Returns false if the handle
    /// is no longer known.
    pub fn requeue(&self, handle: TimerHandle, deadline: Timestamp) -> bool {
        let micros = deadline.timestamp_micros();
        let mut inner = self.inner.lock();
        let Some(old) = inner.timers.get_mut(&handle.0).map(|t| t.deadline.replace(micros)) else {
            return false;
        };
        if let Some(old) = old {
            inner.by_deadline.remove(&(old, handle.0));
        }
        inner.by_deadline.insert((micros, handle.0));
        true
    }

    /// Remove a timer entirely
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        let Some(timer) = inner.timers.remove(&handle.0) else {
            return false;
        };
        if let Some(deadline) = timer.deadline {
            inner.by_deadline.remove(&(deadline, handle.0));
        }
        true
    }

    /// Fire every timer whose deadline is at or before `now`.
    ///
    /// The callback is detached from the queue while it runs, so it can
    /// requeue or cancel without deadlocking. A fired timer that its
    /// callback did not requeue is forgotten; a stale handle is harmless
    /// (`requeue`/`cancel` return false).
    pub fn run_expired(&self, now: Timestamp) -> usize {
        let cutoff = now.timestamp_micros();
        let mut fired = 0;
        loop {
            let (id, mut cb) = {
                let mut inner = self.inner.lock();
                let Some(&(deadline, id)) = inner.by_deadline.iter().next() else {
                    break;
                };
                if deadline > cutoff {
                    break;
                }
                inner.by_deadline.remove(&(deadline, id));
                let Some(timer) = inner.timers.get_mut(&id) else {
                    continue;
                };
                timer.deadline = None;
                let Some(cb) = timer.cb.take() else {
                    continue;
                };
                (id, cb)
            };

            cb(now);
            fired += 1;

            let mut inner = self.inner.lock();
            match inner.timers.get_mut(&id) {
                Some(timer) if timer.deadline.is_some() => timer.cb = Some(cb),
                // Neither requeued nor already cancelled; forget it
                Some(_) => {
                    inner.timers.remove(&id);
                }
                None => {}
            }
        }
        if fired > 0 {
            trace!(fired, "timers expired");
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().timers.is_empty()
    }
}
