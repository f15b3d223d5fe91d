//! Synchronization barrier for a single failover invocation

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Winner-take-all barrier shared between the worker tasks of one failover
/// invocation.
///
/// Holds a task counter behind a mutex and a condition variable. Workers
/// decrement the counter as they finish; a winner can force it to zero to
/// cancel its peers; the invoking thread blocks in [`wait_and_complete`]
/// until the counter drains or the deadline fires. Once `wait_and_complete`
/// has returned the counter never rises again.
///
/// [`wait_and_complete`]: FailoverSync::wait_and_complete
pub struct FailoverSync {
    state: Mutex<SyncState>,
    cv: Condvar,
}

struct SyncState {
    tasks: i64,
    forced: bool,
}

impl FailoverSync {
    /// Create a barrier expecting `task_count` workers
    pub fn new(task_count: i64) -> Self {
        Self {
            state: Mutex::new(SyncState {
                tasks: task_count,
                forced: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Register one more worker; callable only before the barrier completes
    pub fn increment_task(&self) {
        let mut state = self.state.lock();
        state.tasks += 1;
    }

    /// Report one worker finished. With `cancel_others` the counter drops to
    /// zero and every peer observes completion at its next checkpoint;
    /// without it the counter decrements by one.
    pub fn mark_as_complete(&self, cancel_others: bool) {
        let mut state = self.state.lock();
        if cancel_others {
            state.tasks = 0;
            state.forced = true;
        } else {
            state.tasks -= 1;
            // Going negative is expected after a forced completion (workers
            // draining past a timeout); before one it is a caller bug.
            if state.tasks < 0 && !state.forced {
                warn!("failover sync underflow: more completions than registered tasks");
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Block until every worker has reported or `timeout` elapses, then force
    /// completion either way. Returns `true` when the workers drained the
    /// counter before the deadline.
    pub fn wait_and_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.tasks > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Condvar waits are bounded so spurious wakeups re-check both
            // the counter and the deadline.
            self.cv.wait_for(&mut state, deadline - now);
        }
        let drained = state.tasks <= 0;
        state.tasks = 0;
        state.forced = true;
        drop(state);
        self.cv.notify_all();
        drained
    }

    /// Whether the barrier has completed (counter drained or forced)
    pub fn is_completed(&self) -> bool {
        self.state.lock().tasks <= 0
    }

    /// Sleep for at most `duration`, waking early when the barrier completes.
    /// Returns `true` when the barrier completed during the sleep.
    pub fn interruptible_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while state.tasks > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cv.wait_for(&mut state, deadline - now);
        }
        state.tasks <= 0
    }
}
