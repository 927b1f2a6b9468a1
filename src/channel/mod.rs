//! Multicast update streams: [`Producer`] writes, [`Channel`] reads.
//!
//! A stream carries zero or more update values followed by exactly one
//! terminal result. The producer side pushes updates into a bounded replay
//! buffer and fans them out to every subscriber; the write-once terminal
//! transition drains the subscriber registry so nothing outlives a completed
//! stream.
//!
//! ```text
//!                    update(u)                 try_complete(r)
//!  Producer ────────────┬──────────────────────────┬──────────>
//!                       v                          v
//!              [ replay buffer <=cap ]    [ completion slot ]
//!                       │                          │
//!              ┌────────┴────────┐        terminal event, once
//!              v                 v                 v
//!        handler queue     handler queue     (registry drained)
//!              │                 │
//!           drain on          drain on
//!         its executor      its executor
//! ```
//!
//! # Design
//!
//! - One mutex guards the buffer, the completion slot, and the subscriber
//!   registry. Fan-out appends events to each subscriber's private queue
//!   under that lock (no user code runs there), then schedules one
//!   single-flight drain job per subscriber on its executor.
//! - The private queue plus single-flight drain give strict per-subscriber
//!   FIFO relative to `update` call order on any executor, including
//!   concurrent pools. There is no ordering between subscribers.
//! - A new subscriber's queue is preloaded with the buffered values (and the
//!   terminal, if present) under the same lock acquisition that registers
//!   it, so a racing update is either fully in the replay or fully live.
//! - [`Producer`] clones share a guard: dropping the last one while the
//!   stream is open completes it with [`Error::Abandoned`].
//!
//! # Example
//!
//! ```ignore
//! use freshet::{Executor, Producer};
//!
//! let producer = Producer::<i32>::new(4);
//! let sub = producer.channel().on_update(&Executor::serial(), |n| {
//!     println!("got {n}");
//! });
//! producer.update(1);
//! producer.update(2);
//! producer.succeed(());
//! sub.detach();
//! ```

mod iter;
mod ops;
mod proxy;

pub use iter::BlockingIter;
pub use proxy::{ProducerProxy, ProxyEvent};

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Fallible};
use crate::eventual::{Completable, Eventual, Promise};
use crate::executor::Executor;
use crate::registry::Registry;
use crate::subscription::Subscription;
use crate::tracing_compat::trace;

/// One delivery to a stream subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<U, S> {
    /// An intermediate value.
    Update(U),
    /// The terminal result. Always the last event a subscriber sees.
    Completion(Fallible<S>),
}

/// Number of events one drain job processes before rescheduling itself, so
/// a firehose stream cannot monopolize a shared executor.
const DRAIN_BATCH: usize = 32;

struct EventHandler<U, S> {
    executor: Executor,
    callback: Box<dyn Fn(Event<U, S>) + Send + Sync>,
    queue: Mutex<VecDeque<Event<U, S>>>,
    draining: AtomicBool,
}

struct ChannelState<U, S> {
    buffer: VecDeque<U>,
    completion: Option<Fallible<S>>,
    handlers: Registry<Arc<EventHandler<U, S>>>,
    release_pool: Vec<Box<dyn FnOnce() + Send>>,
}

struct ChannelInner<U, S> {
    buffer_capacity: usize,
    state: Mutex<ChannelState<U, S>>,
}

/// Delivers every queued event for one subscriber, one at a time, outside
/// all engine locks. Exactly one drain job is in flight per subscriber.
fn run_drain<U, S>(handler: Arc<EventHandler<U, S>>)
where
    U: Send + 'static,
    S: Send + 'static,
{
    let mut processed = 0;
    loop {
        if processed == DRAIN_BATCH {
            // Yield the executor slot; the drain flag stays held.
            let executor = handler.executor.clone();
            let again = Arc::clone(&handler);
            executor.execute(move || run_drain(again));
            return;
        }
        let next = handler.queue.lock().pop_front();
        match next {
            Some(event) => {
                (handler.callback)(event);
                processed += 1;
            }
            None => {
                handler.draining.store(false, Ordering::Release);
                if handler.queue.lock().is_empty() {
                    return;
                }
                // A push slipped in between the pop and the flag release.
                // Whoever wins the flag owns the new drain.
                if handler.draining.swap(true, Ordering::AcqRel) {
                    return;
                }
            }
        }
    }
}

fn schedule_drains<U, S>(handlers: Vec<Arc<EventHandler<U, S>>>)
where
    U: Send + 'static,
    S: Send + 'static,
{
    for handler in handlers {
        let executor = handler.executor.clone();
        executor.execute(move || run_drain(handler));
    }
}

impl<U, S> ChannelInner<U, S>
where
    U: Send + 'static,
    S: Send + 'static,
{
    fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                completion: None,
                handlers: Registry::new(),
                release_pool: Vec::new(),
            }),
        }
    }

    /// Terminal transition used when every producer handle is gone.
    fn abandon(&self) {
        let mut state = self.state.lock();
        if state.completion.is_some() {
            return;
        }
        trace!("open stream abandoned");
        state.completion = Some(Err(Error::Abandoned));
        let handlers = state.handlers.drain();
        let release_pool = mem::take(&mut state.release_pool);
        let mut to_schedule = Vec::with_capacity(handlers.len());
        for handler in handlers {
            handler
                .queue
                .lock()
                .push_back(Event::Completion(Err(Error::Abandoned)));
            if !handler.draining.swap(true, Ordering::AcqRel) {
                to_schedule.push(handler);
            }
        }
        drop(state);
        schedule_drains(to_schedule);
        for action in release_pool {
            action();
        }
    }
}

impl<U, S> ChannelInner<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    fn update(&self, value: U) {
        let mut state = self.state.lock();
        if state.completion.is_some() {
            return;
        }
        if self.buffer_capacity > 0 {
            state.buffer.push_back(value.clone());
            while state.buffer.len() > self.buffer_capacity {
                state.buffer.pop_front();
            }
        }
        let event = Event::Update(value);
        let mut to_schedule = Vec::new();
        for handler in state.handlers.iter() {
            handler.queue.lock().push_back(event.clone());
            if !handler.draining.swap(true, Ordering::AcqRel) {
                to_schedule.push(Arc::clone(handler));
            }
        }
        drop(state);
        schedule_drains(to_schedule);
    }

    fn try_complete(&self, result: Fallible<S>) -> bool {
        let mut state = self.state.lock();
        if state.completion.is_some() {
            return false;
        }
        state.completion = Some(result.clone());
        let handlers = state.handlers.drain();
        let release_pool = mem::take(&mut state.release_pool);
        let mut to_schedule = Vec::with_capacity(handlers.len());
        for handler in handlers {
            handler
                .queue
                .lock()
                .push_back(Event::Completion(result.clone()));
            if !handler.draining.swap(true, Ordering::AcqRel) {
                to_schedule.push(handler);
            }
        }
        drop(state);
        schedule_drains(to_schedule);
        for action in release_pool {
            action();
        }
        true
    }

    fn subscribe(
        self: &Arc<Self>,
        executor: &Executor,
        callback: Box<dyn Fn(Event<U, S>) + Send + Sync>,
    ) -> Subscription {
        let handler = Arc::new(EventHandler {
            executor: executor.clone(),
            callback,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        });

        let mut state = self.state.lock();
        let preloaded = {
            let mut queue = handler.queue.lock();
            for value in &state.buffer {
                queue.push_back(Event::Update(value.clone()));
            }
            if let Some(result) = &state.completion {
                queue.push_back(Event::Completion(result.clone()));
            }
            !queue.is_empty()
        };

        let subscription = if state.completion.is_some() {
            // Nothing to retain; the preloaded replay plus terminal is all
            // this subscriber will ever see.
            Subscription::inert()
        } else {
            let id = state.handlers.insert(Arc::clone(&handler));
            let weak = Arc::downgrade(self);
            Subscription::new(move || {
                let removed = weak
                    .upgrade()
                    .and_then(|inner| inner.state.lock().handlers.remove(id));
                drop(removed);
            })
        };

        if preloaded {
            handler.draining.store(true, Ordering::Release);
        }
        drop(state);
        if preloaded {
            let executor = handler.executor.clone();
            executor.execute(move || run_drain(handler));
        }
        subscription
    }
}

/// Read view of a stream. Clones share the stream.
#[must_use]
pub struct Channel<U, S = ()> {
    inner: Arc<ChannelInner<U, S>>,
}

impl<U, S> Clone for Channel<U, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Write handle of a stream.
///
/// Clones share the stream and a producer guard: when the last clone drops
/// while the stream is open, the stream completes with
/// [`Error::Abandoned`].
#[must_use]
pub struct Producer<U, S = ()> {
    // Declared before `channel` so the guard's drop still sees a live
    // stream when the last clone goes away.
    _guard: Arc<ProducerGuard>,
    channel: Channel<U, S>,
}

struct ProducerGuard {
    abandon: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if let Some(abandon) = self.abandon.take() {
            abandon();
        }
    }
}

impl<U, S> Clone for Producer<U, S> {
    fn clone(&self) -> Self {
        Self {
            _guard: Arc::clone(&self._guard),
            channel: self.channel.clone(),
        }
    }
}

impl<U, S> Producer<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Opens a stream whose replay buffer keeps the newest
    /// `buffer_capacity` updates. A capacity of zero disables replay: late
    /// subscribers see only values sent after they subscribed.
    pub fn new(buffer_capacity: usize) -> Self {
        let inner = Arc::new(ChannelInner::new(buffer_capacity));
        let weak: Weak<ChannelInner<U, S>> = Arc::downgrade(&inner);
        let guard = Arc::new(ProducerGuard {
            abandon: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.abandon();
                }
            })),
        });
        Self {
            _guard: guard,
            channel: Channel { inner },
        }
    }

    /// Opens a stream with `values` already in the replay buffer.
    pub fn with_buffered(buffer_capacity: usize, values: impl IntoIterator<Item = U>) -> Self {
        let producer = Self::new(buffer_capacity);
        producer.update_many(values);
        producer
    }

    /// Returns a read view of the stream.
    pub fn channel(&self) -> Channel<U, S> {
        self.channel.clone()
    }

    /// Sends one update to the buffer and every subscriber.
    ///
    /// A no-op once the stream has completed.
    pub fn update(&self, value: U) {
        self.channel.inner.update(value);
    }

    /// Sends each value of `values` in order.
    pub fn update_many(&self, values: impl IntoIterator<Item = U>) {
        for value in values {
            self.update(value);
        }
    }

    /// Attempts the terminal transition. The first caller wins: every
    /// subscriber receives the terminal event after its pending updates,
    /// the subscriber registry is drained, and the release pool runs. Later
    /// calls return false and change nothing.
    pub fn try_complete(&self, result: Fallible<S>) -> bool {
        self.channel.inner.try_complete(result)
    }

    /// Completes the stream successfully; false if already completed.
    pub fn succeed(&self, success: S) -> bool {
        self.try_complete(Ok(success))
    }

    /// Completes the stream with a failure; false if already completed.
    pub fn fail(&self, error: Error) -> bool {
        self.try_complete(Err(error))
    }

    /// True once the stream has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.channel.is_completed()
    }
}

impl<U, S> Completable for Producer<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    type Success = S;

    fn try_complete(&self, result: Fallible<S>) -> bool {
        Self::try_complete(self, result)
    }

    fn is_completed(&self) -> bool {
        Self::is_completed(self)
    }
}

impl<U, S> Channel<U, S> {
    /// Size of the replay buffer; zero means no replay.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// True once the stream has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().completion.is_some()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().handlers.len()
    }

    /// Registers an action to run exactly once at the terminal transition,
    /// including completion by abandonment. Runs immediately if the stream
    /// has already completed.
    pub fn release_on_completion(&self, action: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.completion.is_some() {
            drop(state);
            action();
        } else {
            state.release_pool.push(Box::new(action));
        }
    }
}

impl<U, S> Channel<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Snapshot of the replay buffer, oldest first.
    #[must_use]
    pub fn buffered(&self) -> Vec<U> {
        self.inner.state.lock().buffer.iter().cloned().collect()
    }

    /// Snapshot of the terminal result, if completed.
    #[must_use]
    pub fn completion(&self) -> Option<Fallible<S>> {
        self.inner.state.lock().completion.clone()
    }

    /// Registers a handler for every event, run on `executor`.
    ///
    /// The handler first receives the currently buffered values, then live
    /// updates in FIFO order, then the terminal result exactly once.
    /// Dropping the subscription unregisters the handler; detach it to keep
    /// the handler until the terminal event.
    pub fn subscribe<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: Fn(Event<U, S>) + Send + Sync + 'static,
    {
        self.inner.subscribe(executor, Box::new(f))
    }

    /// Like [`subscribe`](Self::subscribe), but only for update values.
    pub fn on_update<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: Fn(U) + Send + Sync + 'static,
    {
        self.subscribe(executor, move |event| {
            if let Event::Update(value) = event {
                f(value);
            }
        })
    }

    /// Like [`subscribe`](Self::subscribe), but only for the terminal
    /// result.
    pub fn on_completion<F>(&self, executor: &Executor, f: F) -> Subscription
    where
        F: FnOnce(Fallible<S>) + Send + 'static,
    {
        let slot = Mutex::new(Some(f));
        self.subscribe(executor, move |event| {
            if let Event::Completion(result) = event {
                if let Some(f) = slot.lock().take() {
                    f(result);
                }
            }
        })
    }

    /// A completion-slot view of the terminal result.
    pub fn completion_eventual(&self) -> Eventual<S> {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_completion(&Executor::immediate(), move |result| {
            let _ = target.try_complete(result);
        })
        .detach();
        promise.eventual()
    }
}

impl<U, S> core::fmt::Debug for Channel<U, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .field("buffered", &state.buffer.len())
            .field("subscribers", &state.handlers.len())
            .field("completed", &state.completion.is_some())
            .finish()
    }
}

impl<U, S> core::fmt::Debug for Producer<U, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Producer")
            .field("channel", &self.channel)
            .finish()
    }
}
