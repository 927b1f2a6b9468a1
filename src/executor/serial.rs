//! Dedicated serial queue executor.
//!
//! One worker thread, one FIFO queue. The worker publishes its queue id in a
//! thread-local so [`Executor::execute_from`](super::Executor::execute_from)
//! can prove it is already inside the queue and skip the hop. When the last
//! executor handle drops, the queue closes; the worker drains what was
//! already submitted and exits.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::tracing_compat::{trace, warn};

use super::{ExecutorId, Job};

thread_local! {
    static CURRENT_QUEUE: Cell<Option<ExecutorId>> = const { Cell::new(None) };
}

/// Id of the serial queue whose worker is the calling thread, if any.
pub(crate) fn current_queue_id() -> Option<ExecutorId> {
    CURRENT_QUEUE.get()
}

struct SerialState {
    jobs: VecDeque<Job>,
    closed: bool,
}

struct SerialInner {
    id: ExecutorId,
    state: Mutex<SerialState>,
    work_available: Condvar,
}

/// Submission handle owned by the serial executor. Closing happens when the
/// executor (and with it this handle) is dropped.
pub(crate) struct SerialHandle {
    inner: Arc<SerialInner>,
}

impl SerialHandle {
    pub(crate) fn spawn(id: ExecutorId) -> Self {
        let inner = Arc::new(SerialInner {
            id,
            state: Mutex::new(SerialState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            work_available: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name(format!("freshet-serial-{}", id.0))
            .spawn(move || worker_loop(&worker_inner));
        if let Err(error) = spawned {
            warn!(?error, "failed to spawn serial queue worker");
            #[cfg(not(feature = "tracing-integration"))]
            let _ = error;
            inner.state.lock().closed = true;
        }

        Self { inner }
    }

    pub(crate) fn submit(&self, job: Job) {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            warn!("job submitted to a closed serial queue; dropping");
            drop(job);
            return;
        }
        state.jobs.push_back(job);
        drop(state);
        self.inner.work_available.notify_one();
    }
}

impl Drop for SerialHandle {
    fn drop(&mut self) {
        self.inner.state.lock().closed = true;
        self.inner.work_available.notify_all();
    }
}

fn worker_loop(inner: &Arc<SerialInner>) {
    CURRENT_QUEUE.set(Some(inner.id));
    trace!(id = inner.id.0, "serial queue worker started");

    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.closed {
                    trace!(id = inner.id.0, "serial queue worker exiting");
                    return;
                }
                inner.work_available.wait(&mut state);
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(id = inner.id.0, "serial queue job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Executor;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn drains_pending_jobs_after_last_handle_drops() {
        let executor = Executor::serial();
        let (tx, rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        executor.execute(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        });
        for i in 0..4 {
            let tx = tx.clone();
            executor.execute(move || {
                tx.send(i).unwrap();
            });
        }

        drop(executor);
        gate_tx.send(()).unwrap();
        for expected in 0..4 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
    }

    #[test]
    fn worker_survives_a_panicking_job() {
        let executor = Executor::serial();
        let (tx, rx) = mpsc::channel();
        executor.execute(|| panic!("job failure"));
        executor.execute(move || {
            tx.send(true).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
