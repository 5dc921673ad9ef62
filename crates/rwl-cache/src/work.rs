//! Background work queue and the in-flight operation tracker.

use crate::Completion;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

struct QueueState {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Single-consumer FIFO of background jobs on one worker thread.
///
/// The original's dedicated persist/append/on-persist finishers collapse
/// onto this one queue (its compile-time default); per-stage batching
/// still happens in the stage FIFOs, not here.
pub(crate) struct WorkQueue {
    shared: Arc<Shared>,
    worker_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub(crate) fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(&worker_shared))
            .unwrap_or_else(|err| panic!("failed to spawn work queue {name}: {err}"));
        let worker_id = join.thread().id();
        Self {
            shared,
            worker_id,
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn queue(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.stopping {
            warn!(event = "work_queue_rejected", "job queued after shutdown");
            return;
        }
        state.jobs.push_back(job);
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Drain remaining jobs, stop the worker, and join it. Safe to call
    /// more than once, and from the worker thread itself (no self-join).
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.cond.notify_one();
        if thread::current().id() == self.worker_id {
            debug!(event = "work_queue_detach", "shutdown from worker thread");
            return;
        }
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.stopping {
                    break None;
                }
                shared.cond.wait(&mut state);
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

struct TrackerState {
    in_flight: u64,
    waiters: Vec<Completion>,
}

/// Counts internal async operations so shutdown can wait for quiesce.
pub(crate) struct OpTracker {
    state: Mutex<TrackerState>,
}

impl OpTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                in_flight: 0,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn start_op(&self) {
        self.state.lock().in_flight += 1;
    }

    pub(crate) fn finish_op(&self) {
        let waiters = {
            let mut state = self.state.lock();
            debug_assert!(state.in_flight > 0);
            state.in_flight -= 1;
            if state.in_flight == 0 {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Run `on_idle` once no operations are in flight (immediately if
    /// that is already the case).
    pub(crate) fn wait_for_idle(&self, on_idle: Completion) {
        let run_now = {
            let mut state = self.state.lock();
            if state.in_flight == 0 {
                true
            } else {
                state.waiters.push(on_idle);
                return;
            }
        };
        if run_now {
            on_idle(Ok(()));
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> u64 {
        self.state.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order() {
        let queue = WorkQueue::new("test-wq");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..8 {
            let seen = Arc::clone(&seen);
            queue.queue(Box::new(move || seen.lock().push(tag)));
        }
        queue.shutdown();
        assert_eq!(*seen.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_pending_jobs() {
        let queue = WorkQueue::new("test-wq-drain");
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            queue.queue(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn tracker_fires_waiters_at_zero() {
        let tracker = OpTracker::new();
        let fired = Arc::new(AtomicU32::new(0));

        // Idle tracker completes immediately.
        let fired_clone = Arc::clone(&fired);
        tracker.wait_for_idle(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tracker.start_op();
        tracker.start_op();
        let fired_clone = Arc::clone(&fired);
        tracker.wait_for_idle(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.finish_op();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tracker.finish_op();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.in_flight(), 0);
    }
}
