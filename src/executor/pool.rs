//! Shared worker pool executor.
//!
//! A lock-free [`SegQueue`] feeds a set of worker threads that scale lazily
//! between a configured floor and ceiling. Workers park on a condvar when the
//! queue is empty and retire after an idle timeout while above the floor.
//!
//! # Design
//!
//! - Threads are created on demand: a submit that finds no idle worker and
//!   room below `max_threads` spawns one. Nothing is prewarmed.
//! - Shutdown is graceful: already-queued jobs drain, then workers exit.
//!   Jobs submitted after shutdown are dropped; any completion handle such a
//!   job owned resolves as abandoned through its drop guard, so nothing
//!   waits forever on it.
//! - A panicking job is caught and logged; the worker survives.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::tracing_compat::{trace, warn};

use super::{Executor, Job};

struct PoolInner {
    config: PoolConfig,
    queue: SegQueue<Job>,
    queued_jobs: AtomicUsize,
    total_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    next_worker_id: AtomicUsize,
    shutdown: AtomicBool,
    park_mutex: Mutex<()>,
    work_available: Condvar,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable submission handle stored inside pool executors.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    inner: Arc<PoolInner>,
}

impl PoolHandle {
    pub(crate) fn submit(&self, job: Job) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("job submitted to a shut down worker pool; dropping");
            drop(job);
            return;
        }
        self.inner.queue.push(job);
        self.inner.queued_jobs.fetch_add(1, Ordering::AcqRel);
        {
            let _guard = self.inner.park_mutex.lock();
            self.inner.work_available.notify_one();
        }
        if self.inner.idle_threads.load(Ordering::Acquire) == 0 {
            maybe_spawn_worker(&self.inner);
        }
    }
}

/// Pool of worker threads behind [`Executor::primary`] and custom pool
/// executors.
///
/// The pool object owns the workers. Dropping it signals shutdown; executors
/// cloned from it keep working only until the already-queued jobs drain.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Builds a pool from `config` (normalized first). No threads start
    /// until the first job arrives.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalize();
        Self {
            inner: Arc::new(PoolInner {
                config,
                queue: SegQueue::new(),
                queued_jobs: AtomicUsize::new(0),
                total_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                park_mutex: Mutex::new(()),
                work_available: Condvar::new(),
                thread_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns an executor submitting to this pool.
    #[must_use]
    pub fn executor(&self) -> Executor {
        Executor::from_pool(PoolHandle {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of jobs queued and not yet picked up.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.inner.queued_jobs.load(Ordering::Acquire)
    }

    /// Number of live worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.total_threads.load(Ordering::Acquire)
    }

    /// True once shutdown has been signalled.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Signals shutdown and wakes every parked worker.
    ///
    /// Already-queued jobs still run; workers exit once the queue is empty.
    /// Jobs submitted from this point on are dropped.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("worker pool shutting down");
        let _guard = self.inner.park_mutex.lock();
        self.inner.work_available.notify_all();
    }

    /// Signals shutdown and waits up to `timeout` for every worker to exit.
    ///
    /// Returns true when the pool fully stopped within the timeout. On
    /// timeout the remaining workers keep draining in the background but can
    /// no longer be joined.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = Instant::now() + timeout;
        while self.inner.total_threads.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let handles = mem::take(&mut *self.inner.thread_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("queued", &self.queued_jobs())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn maybe_spawn_worker(inner: &Arc<PoolInner>) {
    loop {
        let count = inner.total_threads.load(Ordering::Acquire);
        if count >= inner.config.max_threads {
            return;
        }
        if count > 0 && inner.queued_jobs.load(Ordering::Acquire) == 0 {
            return;
        }
        if inner
            .total_threads
            .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            spawn_worker(inner);
            return;
        }
    }
}

// The caller has already reserved this thread in `total_threads`.
fn spawn_worker(inner: &Arc<PoolInner>) {
    let worker = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{worker}", inner.config.thread_name_prefix);
    let mut builder = thread::Builder::new().name(name);
    if let Some(stack_size) = inner.config.stack_size {
        builder = builder.stack_size(stack_size);
    }
    let thread_inner = Arc::clone(inner);
    match builder.spawn(move || worker_loop(&thread_inner, worker)) {
        Ok(handle) => inner.thread_handles.lock().push(handle),
        Err(error) => {
            inner.total_threads.fetch_sub(1, Ordering::AcqRel);
            warn!(worker, ?error, "failed to spawn pool worker");
            #[cfg(not(feature = "tracing-integration"))]
            let _ = error;
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>, worker: usize) {
    #[cfg(not(feature = "tracing-integration"))]
    let _ = worker;
    trace!(worker, "pool worker started");
    let mut retired = false;

    loop {
        while let Some(job) = inner.queue.pop() {
            inner.queued_jobs.fetch_sub(1, Ordering::AcqRel);
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!(worker, "pool job panicked");
            }
        }

        let mut guard = inner.park_mutex.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.idle_threads.fetch_add(1, Ordering::AcqRel);
        let timed_out = inner
            .work_available
            .wait_for(&mut guard, inner.config.idle_timeout)
            .timed_out();
        inner.idle_threads.fetch_sub(1, Ordering::AcqRel);
        drop(guard);

        if timed_out && inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            let mut may_retire = false;
            let _ = inner
                .total_threads
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    if count > inner.config.min_threads {
                        may_retire = true;
                        Some(count - 1)
                    } else {
                        may_retire = false;
                        None
                    }
                });
            if may_retire {
                retired = true;
                trace!(worker, "idle pool worker retiring");
                break;
            }
        }
    }

    if !retired {
        inner.total_threads.fetch_sub(1, Ordering::AcqRel);
    }
    trace!(worker, "pool worker exited");
}
