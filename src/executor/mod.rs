//! Scheduling strategies for handler and operator callbacks.
//!
//! An [`Executor`] is an immutable value describing where a callback runs:
//! inline on the calling thread, on the shared worker pool, on a dedicated
//! serial queue, after a delay, or through a user-supplied scheduling
//! function. Every subscribe and transform operation takes the executor for
//! its callback explicitly; nothing in the crate schedules through hidden
//! global state beyond the process-default pool and timer, which are built
//! once from the installed [`Config`](crate::Config).
//!
//! # Identity and inline execution
//!
//! [`Executor::execute_from`] runs a callback inline, without a scheduling
//! hop, when doing so cannot be observed:
//!
//! - an immediate executor always runs inline;
//! - a serial executor runs inline when the calling thread is currently that
//!   queue's worker, so the job still happens inside the current queue slot;
//! - two function executors run inline into each other only when both carry
//!   the same explicit [`ExecutorId`] token, which is the caller's assertion
//!   that they dispatch onto the same serial resource.
//!
//! Pool executors never run inline; a pool makes no ordering promise that
//! inlining could preserve, and hopping keeps callers from blocking each
//! other.
//!
//! # Example
//!
//! ```ignore
//! use freshet::Executor;
//!
//! let serial = Executor::serial();
//! serial.execute(|| println!("first"));
//! serial.execute(|| println!("second"));
//! ```

mod pool;
mod serial;
mod timer;

pub use pool::WorkerPool;
pub use timer::DelayTimer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::Config;

pub(crate) use pool::PoolHandle;

/// Boxed unit of work passed to a scheduling strategy.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity token making two executors provably the same serial resource.
///
/// Serial queues mint one automatically. Function executors carry one only
/// when built through [`Executor::from_fn_with_identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

impl ExecutorId {
    /// Mints a fresh process-unique token.
    #[must_use]
    pub fn unique() -> Self {
        Self(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

enum ExecutorKind {
    Immediate,
    Pool(PoolHandle),
    Serial(serial::SerialHandle),
    Custom(Box<dyn Fn(Job) + Send + Sync>),
}

struct ExecutorInner {
    id: Option<ExecutorId>,
    kind: ExecutorKind,
}

/// Where a callback runs.
///
/// Cheap to clone; clones share the underlying strategy and identity.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Runs every job synchronously on whichever thread submits it.
    #[must_use]
    pub fn immediate() -> Self {
        static IMMEDIATE: OnceLock<Executor> = OnceLock::new();
        IMMEDIATE
            .get_or_init(|| Self {
                inner: Arc::new(ExecutorInner {
                    id: None,
                    kind: ExecutorKind::Immediate,
                }),
            })
            .clone()
    }

    /// The process-default worker pool.
    ///
    /// Built on first use from the installed [`Config`](crate::Config);
    /// install a config before touching this to change its sizing.
    #[must_use]
    pub fn primary() -> Self {
        static PRIMARY: OnceLock<WorkerPool> = OnceLock::new();
        PRIMARY
            .get_or_init(|| WorkerPool::new(Config::installed().pool.clone()))
            .executor()
    }

    /// Spawns a fresh serial queue and returns its executor.
    ///
    /// Jobs run one at a time, FIFO, on a dedicated worker thread. The queue
    /// drains and the worker exits once the last executor clone is dropped.
    #[must_use]
    pub fn serial() -> Self {
        let id = ExecutorId::unique();
        let handle = serial::SerialHandle::spawn(id);
        Self {
            inner: Arc::new(ExecutorInner {
                id: Some(id),
                kind: ExecutorKind::Serial(handle),
            }),
        }
    }

    /// Wraps a user scheduling function with no identity.
    ///
    /// The function receives each boxed job and decides where it runs. Such
    /// an executor is never inline-compatible with anything.
    #[must_use]
    pub fn from_fn<F>(schedule: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ExecutorInner {
                id: None,
                kind: ExecutorKind::Custom(Box::new(schedule)),
            }),
        }
    }

    /// Wraps a user scheduling function carrying an explicit identity token.
    ///
    /// Two executors built with the same token are treated as the same
    /// serial resource: [`Executor::execute_from`] runs jobs inline between
    /// them. The caller asserts that the token is only shared by functions
    /// dispatching onto one serial resource.
    #[must_use]
    pub fn from_fn_with_identity<F>(identity: ExecutorId, schedule: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ExecutorInner {
                id: Some(identity),
                kind: ExecutorKind::Custom(Box::new(schedule)),
            }),
        }
    }

    pub(crate) fn from_pool(handle: PoolHandle) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                id: None,
                kind: ExecutorKind::Pool(handle),
            }),
        }
    }

    /// Returns this executor's identity token, if it has one.
    #[must_use]
    pub fn id(&self) -> Option<ExecutorId> {
        self.inner.id
    }

    /// Returns true when the calling thread is currently inside this
    /// executor: always for an immediate executor, and on the worker thread
    /// for a serial queue. Pool and function executors report false.
    #[must_use]
    pub fn is_current(&self) -> bool {
        match &self.inner.kind {
            ExecutorKind::Immediate => true,
            ExecutorKind::Serial(_) => serial::current_queue_id() == self.inner.id,
            ExecutorKind::Pool(_) | ExecutorKind::Custom(_) => false,
        }
    }

    /// Schedules `job` through this executor's strategy.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Box::new(job));
    }

    /// Runs `job` inline when this executor is provably compatible with the
    /// calling context, otherwise schedules it.
    ///
    /// `caller` is the executor the current code is known to be running on,
    /// if any. Inline eligibility never changes observable ordering; it only
    /// removes a scheduling hop.
    pub fn execute_from<F>(&self, caller: Option<&Executor>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.can_run_inline(caller) {
            job();
        } else {
            self.schedule(Box::new(job));
        }
    }

    /// Schedules `job` onto this executor after `delay` has elapsed.
    ///
    /// The shared [`DelayTimer`] parks until the deadline, then hands the
    /// job to this executor. The delay is a lower bound.
    pub fn execute_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        DelayTimer::shared().schedule_after(delay, self, job);
    }

    fn can_run_inline(&self, caller: Option<&Executor>) -> bool {
        match &self.inner.kind {
            ExecutorKind::Immediate => true,
            // The thread-local marker is the ground truth: inline is safe
            // exactly when we are already inside this queue's current slot.
            ExecutorKind::Serial(_) => serial::current_queue_id() == self.inner.id,
            ExecutorKind::Custom(_) => match (self.inner.id, caller.and_then(Executor::id)) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            },
            ExecutorKind::Pool(_) => false,
        }
    }

    fn schedule(&self, job: Job) {
        match &self.inner.kind {
            ExecutorKind::Immediate => job(),
            ExecutorKind::Pool(pool) => pool.submit(job),
            ExecutorKind::Serial(queue) => queue.submit(job),
            ExecutorKind::Custom(schedule) => schedule(job),
        }
    }
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.inner.kind {
            ExecutorKind::Immediate => "immediate",
            ExecutorKind::Pool(_) => "pool",
            ExecutorKind::Serial(_) => "serial",
            ExecutorKind::Custom(_) => "custom",
        };
        f.debug_struct("Executor")
            .field("kind", &kind)
            .field("id", &self.inner.id)
            .finish()
    }
}
