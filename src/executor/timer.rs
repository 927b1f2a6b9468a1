//! Delay timer behind [`Executor::execute_after`](super::Executor::execute_after).
//!
//! A min-heap of deadlines and one driver thread. The driver parks until the
//! earliest deadline, pops everything due under the lock, then hands each job
//! to its target executor outside the lock. Entries with equal deadlines fire
//! in submission order via a sequence tie-break.

use std::cmp::Ordering as CmpOrdering;
use std::collections::binary_heap::PeekMut;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::tracing_compat::{trace, warn};

use super::{Executor, Job};

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    executor: Executor,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap max is the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    closed: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    tick: Condvar,
}

/// One-shot delay scheduler.
///
/// [`DelayTimer::shared`] is the process instance used by
/// [`Executor::execute_after`](super::Executor::execute_after); private
/// timers can be built for tests or isolation. Dropping a private timer
/// discards its pending entries; any completion handle a discarded job owned
/// resolves as abandoned through its drop guard.
pub struct DelayTimer {
    inner: Arc<TimerInner>,
}

impl DelayTimer {
    /// Starts a timer with its own driver thread.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            tick: Condvar::new(),
        });

        let driver_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name("freshet-timer".to_string())
            .spawn(move || driver_loop(&driver_inner));
        if let Err(error) = spawned {
            warn!(?error, "failed to spawn timer driver");
            #[cfg(not(feature = "tracing-integration"))]
            let _ = error;
            inner.state.lock().closed = true;
        }

        Self { inner }
    }

    /// The process-wide timer, started on first use.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<DelayTimer> = OnceLock::new();
        SHARED.get_or_init(Self::new)
    }

    /// Schedules `job` onto `executor` once `delay` has elapsed.
    ///
    /// The delay is a lower bound. An immediate `executor` runs the job on
    /// the driver thread.
    pub fn schedule_after<F>(&self, delay: Duration, executor: &Executor, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            warn!("delay scheduled on a closed timer; dropping job");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            executor: executor.clone(),
            job: Box::new(job),
        });
        drop(state);
        self.inner.tick.notify_one();
    }

    /// Number of entries waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().heap.len()
    }
}

impl Default for DelayTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.heap.clear();
        drop(state);
        self.inner.tick.notify_all();
    }
}

impl core::fmt::Debug for DelayTimer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DelayTimer")
            .field("pending", &self.pending())
            .finish()
    }
}

fn driver_loop(inner: &Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.closed {
            trace!("timer driver exiting");
            return;
        }
        let Some(next_deadline) = state.heap.peek().map(|entry| entry.deadline) else {
            inner.tick.wait(&mut state);
            continue;
        };
        let now = Instant::now();
        if next_deadline > now {
            inner.tick.wait_until(&mut state, next_deadline);
            continue;
        }

        let mut due = Vec::new();
        while let Some(top) = state.heap.peek_mut() {
            if top.deadline > now {
                break;
            }
            due.push(PeekMut::pop(top));
        }
        MutexGuard::unlocked(&mut state, || {
            for entry in due {
                entry.executor.schedule(entry.job);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_the_delay() {
        let timer = DelayTimer::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timer.schedule_after(Duration::from_millis(40), &Executor::immediate(), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(40));
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let timer = DelayTimer::new();
        let (tx, rx) = mpsc::channel();
        let late = tx.clone();
        timer.schedule_after(Duration::from_millis(80), &Executor::immediate(), move || {
            late.send("late").unwrap();
        });
        timer.schedule_after(Duration::from_millis(20), &Executor::immediate(), move || {
            tx.send("early").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn back_to_back_deadlines_fire_in_submission_order() {
        let timer = DelayTimer::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            timer.schedule_after(Duration::from_millis(30), &Executor::immediate(), move || {
                tx.send(i).unwrap();
            });
        }
        for expected in 0..4 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
    }

    #[test]
    fn drop_discards_pending_entries() {
        let timer = DelayTimer::new();
        let (tx, rx) = mpsc::channel::<()>();
        timer.schedule_after(Duration::from_millis(50), &Executor::immediate(), move || {
            tx.send(()).unwrap();
        });
        drop(timer);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
