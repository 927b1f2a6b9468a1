//! Write-once completion engine: [`Promise`] writes, [`Eventual`] reads.
//!
//! An eventual value completes exactly once with a [`Fallible`] result and is
//! immutable from then on. Any number of handlers may subscribe before or
//! after completion; each observes the result exactly once, on its own
//! executor. Blocking consumers park on [`Eventual::wait`].
//!
//! # Design
//!
//! - One mutex-guarded state machine per value: `Pending` (handler registry
//!   plus release pool) transitions once to `Done(result)`.
//! - First writer wins. The winning [`Promise::try_complete`] takes the
//!   handlers and release pool out under the lock, stores the result, then
//!   dispatches and releases outside the lock. Losing writers observe
//!   `false` and change nothing.
//! - [`Promise`] clones share a completer guard. When the last clone drops
//!   while the value is still pending, the value completes with
//!   [`Error::Abandoned`], so no subscriber or waiter parks forever on a
//!   result that can no longer arrive.
//! - Handlers are owned by the value; the [`Subscription`] returned from
//!   [`Eventual::on_completion`] prunes its slot on drop, or
//!   [`detach`](Subscription::detach)es to stay installed.
//!
//! # Example
//!
//! ```ignore
//! use freshet::{Executor, Promise};
//!
//! let promise = Promise::new();
//! let doubled = promise
//!     .eventual()
//!     .map(&Executor::primary(), |n: i32| n * 2);
//!
//! promise.succeed(21);
//! assert_eq!(doubled.wait(), Ok(42));
//! ```

use std::any::Any;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Fallible};
use crate::executor::{DelayTimer, Executor};
use crate::registry::Registry;
use crate::subscription::Subscription;
use crate::tracing_compat::trace;

/// Write side of a completion slot. Implemented by [`Promise`] and
/// [`Producer`](crate::Producer), and consumed generically by
/// [`CancellationToken`](crate::CancellationToken) and
/// [`ExecutionContext`](crate::ExecutionContext).
pub trait Completable: Send + Sync + 'static {
    /// Value the slot completes with on success.
    type Success;

    /// Attempts the terminal transition; false if already completed.
    fn try_complete(&self, result: Fallible<Self::Success>) -> bool;

    /// True once the terminal transition happened.
    fn is_completed(&self) -> bool;

    /// Completes with a success value; false if already completed.
    fn succeed(&self, value: Self::Success) -> bool {
        self.try_complete(Ok(value))
    }

    /// Completes with a failure; false if already completed.
    fn fail(&self, error: Error) -> bool {
        self.try_complete(Err(error))
    }
}

struct PendingHandler<T> {
    executor: Executor,
    callback: Box<dyn FnOnce(Fallible<T>) + Send>,
}

enum CompletionState<T> {
    Pending {
        handlers: Registry<PendingHandler<T>>,
        release_pool: Vec<Box<dyn FnOnce() + Send>>,
    },
    Done(Fallible<T>),
}

struct EventualInner<T> {
    state: Mutex<CompletionState<T>>,
    completed: Condvar,
}

type Drained<T> = (Vec<PendingHandler<T>>, Vec<Box<dyn FnOnce() + Send>>);

impl<T> EventualInner<T> {
    fn new_pending() -> Self {
        Self {
            state: Mutex::new(CompletionState::Pending {
                handlers: Registry::new(),
                release_pool: Vec::new(),
            }),
            completed: Condvar::new(),
        }
    }

    /// Stores `stored` as the final result if still pending, handing back
    /// the drained handlers and release pool. Wakes blocked waiters.
    fn finalize(&self, stored: Fallible<T>) -> Option<Drained<T>> {
        let mut state = self.state.lock();
        match &mut *state {
            CompletionState::Done(_) => None,
            CompletionState::Pending {
                handlers,
                release_pool,
            } => {
                let handlers = handlers.drain();
                let release_pool = mem::take(release_pool);
                *state = CompletionState::Done(stored);
                drop(state);
                self.completed.notify_all();
                Some((handlers, release_pool))
            }
        }
    }

}

impl<T: Send + 'static> EventualInner<T> {
    /// Fails a still-pending value whose every write handle is gone.
    fn abandon(&self) {
        if let Some((handlers, release_pool)) = self.finalize(Err(Error::Abandoned)) {
            trace!("pending eventual abandoned");
            for handler in handlers {
                handler
                    .executor
                    .execute(move || (handler.callback)(Err(Error::Abandoned)));
            }
            for action in release_pool {
                action();
            }
        }
    }
}

struct CompleterGuard {
    abandon: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for CompleterGuard {
    fn drop(&mut self) {
        if let Some(abandon) = self.abandon.take() {
            abandon();
        }
    }
}

/// Read view of a completion slot.
///
/// Clones share the slot. The view alone can never complete it; dropping
/// views has no effect on pending state.
#[must_use]
pub struct Eventual<T> {
    inner: Arc<EventualInner<T>>,
}

impl<T> Clone for Eventual<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Write handle of a completion slot.
///
/// Clones share both the slot and the completer guard: when the last clone
/// drops while the slot is pending, the slot fails with
/// [`Error::Abandoned`].
#[must_use]
pub struct Promise<T> {
    // Declared before `eventual` so the guard's drop still sees a live
    // slot when the last clone goes away.
    _guard: Arc<CompleterGuard>,
    eventual: Eventual<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            _guard: Arc::clone(&self._guard),
            eventual: self.eventual.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a pending slot and returns its write handle.
    pub fn new() -> Self {
        let inner = Arc::new(EventualInner::new_pending());
        let weak: Weak<EventualInner<T>> = Arc::downgrade(&inner);
        let guard = Arc::new(CompleterGuard {
            abandon: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.abandon();
                }
            })),
        });
        Self {
            _guard: guard,
            eventual: Eventual { inner },
        }
    }
}

impl<T> Promise<T> {
    /// Returns a read view of the slot.
    pub fn eventual(&self) -> Eventual<T> {
        self.eventual.clone()
    }

    /// True once the slot has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.eventual.is_completed()
    }

    /// Registers an action to run exactly once when the slot completes,
    /// including completion by abandonment. Runs immediately if the slot is
    /// already done.
    pub fn release_on_completion(&self, action: impl FnOnce() + Send + 'static) {
        self.eventual.release_on_completion(action);
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Attempts the terminal transition. The first caller wins: handlers are
    /// dispatched onto their executors with clones of the result, the
    /// release pool runs, and blocked waiters wake. Later calls return
    /// false and change nothing.
    pub fn try_complete(&self, result: Fallible<T>) -> bool {
        let Some((handlers, release_pool)) = self.eventual.inner.finalize(result.clone()) else {
            return false;
        };
        for handler in handlers {
            let value = result.clone();
            handler.executor.execute(move || (handler.callback)(value));
        }
        for action in release_pool {
            action();
        }
        true
    }

    /// Completes with a success value; false if already completed.
    pub fn succeed(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    /// Completes with a failure; false if already completed.
    pub fn fail(&self, error: Error) -> bool {
        self.try_complete(Err(error))
    }
}

impl<T: Clone + Send + 'static> Completable for Promise<T> {
    type Success = T;

    fn try_complete(&self, result: Fallible<T>) -> bool {
        Self::try_complete(self, result)
    }

    fn is_completed(&self) -> bool {
        Self::is_completed(self)
    }
}

impl<T> Eventual<T> {
    /// An already-completed value.
    pub fn from_result(result: Fallible<T>) -> Self {
        Self {
            inner: Arc::new(EventualInner {
                state: Mutex::new(CompletionState::Done(result)),
                completed: Condvar::new(),
            }),
        }
    }

    /// An already-succeeded value.
    pub fn succeeded(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// An already-failed value.
    pub fn failed(error: Error) -> Self {
        Self::from_result(Err(error))
    }

    /// True once the value has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(&*self.inner.state.lock(), CompletionState::Done(_))
    }

    /// Registers an action to run exactly once when the value completes,
    /// including completion by abandonment. Runs immediately if already
    /// done.
    pub fn release_on_completion(&self, action: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            CompletionState::Pending { release_pool, .. } => {
                release_pool.push(Box::new(action));
            }
            CompletionState::Done(_) => {
                drop(state);
                action();
            }
        }
    }
}

impl<T: Clone + Send + 'static> Eventual<T> {
    /// Snapshot of the result, if completed.
    #[must_use]
    pub fn completion(&self) -> Option<Fallible<T>> {
        match &*self.inner.state.lock() {
            CompletionState::Done(result) => Some(result.clone()),
            CompletionState::Pending { .. } => None,
        }
    }

    /// Registers a one-shot handler for the result, run on `executor`.
    ///
    /// If the value is already complete the handler is scheduled right away
    /// and the returned subscription is inert. Otherwise dropping the
    /// subscription unregisters the handler; detach it to keep the handler
    /// for the value's lifetime.
    pub fn on_completion<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: FnOnce(Fallible<T>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            CompletionState::Done(result) => {
                let result = result.clone();
                drop(state);
                executor.execute(move || f(result));
                Subscription::inert()
            }
            CompletionState::Pending { handlers, .. } => {
                let id = handlers.insert(PendingHandler {
                    executor: executor.clone(),
                    callback: Box::new(f),
                });
                drop(state);
                let weak = Arc::downgrade(&self.inner);
                Subscription::new(move || {
                    let removed = weak.upgrade().and_then(|inner| {
                        match &mut *inner.state.lock() {
                            CompletionState::Pending { handlers, .. } => handlers.remove(id),
                            CompletionState::Done(_) => None,
                        }
                    });
                    drop(removed);
                })
            }
        }
    }

    /// Like [`on_completion`](Self::on_completion), but only for successes.
    pub fn on_success<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_completion(executor, move |result| {
            if let Ok(value) = result {
                f(value);
            }
        })
    }

    /// Like [`on_completion`](Self::on_completion), but only for failures.
    pub fn on_failure<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.on_completion(executor, move |result| {
            if let Err(error) = result {
                f(error);
            }
        })
    }

    /// Parks the calling thread until the value completes.
    ///
    /// Never call this on the executor that will produce the completion;
    /// waiting on a serial queue for a result scheduled behind the wait
    /// deadlocks, and the engine cannot detect it.
    pub fn wait(&self) -> Fallible<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let CompletionState::Done(result) = &*state {
                return result.clone();
            }
            self.inner.completed.wait(&mut state);
        }
    }

    /// Parks until completion or until `timeout` elapses.
    ///
    /// Returns `None` on timeout. Same deadlock contract as
    /// [`wait`](Self::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Fallible<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let CompletionState::Done(result) = &*state {
                return Some(result.clone());
            }
            if self
                .inner
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &*state {
                    CompletionState::Done(result) => Some(result.clone()),
                    CompletionState::Pending { .. } => None,
                };
            }
        }
    }

    /// Derived value holding `f(success)`; failures pass through unchanged.
    pub fn map<R, F>(&self, executor: &Executor, f: F) -> Eventual<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(executor, move |result| {
            let _ = target.try_complete(result.map(f));
        })
        .detach();
        promise.eventual()
    }

    /// Derived value from a fallible transform; an `Err` return becomes the
    /// failure completion. Failures of the source pass through unchanged.
    pub fn try_map<R, F>(&self, executor: &Executor, f: F) -> Eventual<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Fallible<R> + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(executor, move |result| {
            let _ = target.try_complete(result.and_then(f));
        })
        .detach();
        promise.eventual()
    }

    /// Derived value adopting the completion of `f(success)`.
    ///
    /// `f` runs on `executor`; the inner value's completion is relayed as it
    /// arrives. Failures of the source pass through without calling `f`.
    pub fn flat_map<R, F>(&self, executor: &Executor, f: F) -> Eventual<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Eventual<R> + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(executor, move |result| match result {
            Ok(value) => {
                let inner = f(value);
                let chained = target.clone();
                inner
                    .on_completion(&Executor::immediate(), move |inner_result| {
                        let _ = chained.try_complete(inner_result);
                    })
                    .detach();
            }
            Err(error) => {
                let _ = target.try_complete(Err(error));
            }
        })
        .detach();
        promise.eventual()
    }

    /// Derived value converting a failure into a success via `f`.
    pub fn recover<F>(&self, executor: &Executor, f: F) -> Eventual<T>
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(executor, move |result| {
            let _ = target.try_complete(result.or_else(|error| Ok(f(error))));
        })
        .detach();
        promise.eventual()
    }

    /// Derived value giving a failure one fallible second chance.
    pub fn try_recover<F>(&self, executor: &Executor, f: F) -> Eventual<T>
    where
        F: FnOnce(Error) -> Fallible<T> + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(executor, move |result| {
            let _ = target.try_complete(result.or_else(f));
        })
        .detach();
        promise.eventual()
    }

    /// Derived value re-emitting the completion `delay` after it arrives,
    /// on `executor`.
    pub fn delayed(&self, delay: Duration, executor: &Executor) -> Eventual<T> {
        let promise = Promise::new();
        let target = promise.clone();
        let fire_on = executor.clone();
        self.on_completion(&Executor::immediate(), move |result| {
            DelayTimer::shared().schedule_after(delay, &fire_on, move || {
                let _ = target.try_complete(result);
            });
        })
        .detach();
        promise.eventual()
    }

    /// Pairs two completions; the first failure wins.
    pub fn zip<B>(&self, other: &Eventual<B>, executor: &Executor) -> Eventual<(T, B)>
    where
        B: Clone + Send + 'static,
    {
        let promise = Promise::new();
        let slots: Arc<Mutex<(Option<T>, Option<B>)>> = Arc::new(Mutex::new((None, None)));

        let target = promise.clone();
        let pair = Arc::clone(&slots);
        self.on_completion(executor, move |result| match result {
            Ok(left) => {
                let mut slots = pair.lock();
                if let Some(right) = slots.1.take() {
                    drop(slots);
                    let _ = target.try_complete(Ok((left, right)));
                } else {
                    slots.0 = Some(left);
                }
            }
            Err(error) => {
                let _ = target.try_complete(Err(error));
            }
        })
        .detach();

        let target = promise.clone();
        let pair = Arc::clone(&slots);
        other
            .on_completion(executor, move |result| match result {
                Ok(right) => {
                    let mut slots = pair.lock();
                    if let Some(left) = slots.0.take() {
                        drop(slots);
                        let _ = target.try_complete(Ok((left, right)));
                    } else {
                        slots.1 = Some(right);
                    }
                }
                Err(error) => {
                    let _ = target.try_complete(Err(error));
                }
            })
            .detach();

        promise.eventual()
    }
}

impl<T> Eventual<T>
where
    T: Clone + Send + Sync + Any,
{
    /// Erases the success type for heterogeneous storage; recover it with
    /// [`Eventual::downcast`].
    pub fn erased(&self, executor: &Executor) -> Eventual<Arc<dyn Any + Send + Sync>> {
        self.map(executor, |value| {
            Arc::new(value) as Arc<dyn Any + Send + Sync>
        })
    }
}

impl Eventual<Arc<dyn Any + Send + Sync>> {
    /// Recovers a concrete success type from an erased value.
    ///
    /// A mismatched type completes the derived value with
    /// [`Error::CastFailed`].
    pub fn downcast<T>(&self, executor: &Executor) -> Eventual<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.try_map(executor, |value| {
            value
                .downcast::<T>()
                .map(|concrete| (*concrete).clone())
                .map_err(|_| Error::CastFailed)
        })
    }
}

impl<T> core::fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &*self.inner.state.lock() {
            CompletionState::Pending { handlers, .. } => format!("pending({})", handlers.len()),
            CompletionState::Done(Ok(_)) => "succeeded".to_string(),
            CompletionState::Done(Err(_)) => "failed".to_string(),
        };
        f.debug_struct("Eventual").field("state", &state).finish()
    }
}

impl<T> core::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}
