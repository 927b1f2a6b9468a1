//! Producer-shaped handle that routes every write through user logic.
//!
//! Where a plain [`Producer`] applies `update` and `try_complete` directly,
//! a [`ProducerProxy`] first hands the intent to a routing handler on a
//! designated executor. The handler observes a [`ProxyEvent`] plus the
//! backing producer and decides whether, and in what form, to apply it.
//! Two-way bound properties are built from this: the write side of a bound
//! endpoint routes through its owner before touching the stream.

use std::sync::Arc;

use crate::channel::{Channel, Producer};
use crate::error::{Error, Fallible};
use crate::executor::Executor;

/// One routed write intent.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent<U, S> {
    /// An `update` call with its value.
    Update(U),
    /// A `complete`/`cancel` call with its terminal result.
    Complete(Fallible<S>),
}

/// Producer handle whose writes pass through a routing handler.
///
/// Clones share the backing stream and the handler. Dropping the last clone
/// drops the backing producer, abandoning the stream if it is still open.
#[must_use]
pub struct ProducerProxy<U, S = ()> {
    backing: Producer<U, S>,
    executor: Executor,
    route: Arc<dyn Fn(ProxyEvent<U, S>, &Producer<U, S>) + Send + Sync>,
}

impl<U, S> Clone for ProducerProxy<U, S> {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
            executor: self.executor.clone(),
            route: Arc::clone(&self.route),
        }
    }
}

impl<U, S> ProducerProxy<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Opens a proxied stream. Every write is handed to `route` on
    /// `executor`; the handler applies it to the backing producer (possibly
    /// transformed) or swallows it.
    pub fn new<F>(buffer_capacity: usize, executor: &Executor, route: F) -> Self
    where
        F: Fn(ProxyEvent<U, S>, &Producer<U, S>) + Send + Sync + 'static,
    {
        Self {
            backing: Producer::new(buffer_capacity),
            executor: executor.clone(),
            route: Arc::new(route),
        }
    }

    /// Read view of the backing stream.
    pub fn channel(&self) -> Channel<U, S> {
        self.backing.channel()
    }

    /// Routes an update intent. Dropped without routing once the stream has
    /// completed.
    pub fn update(&self, value: U) {
        self.dispatch(ProxyEvent::Update(value));
    }

    /// Routes a terminal intent. Dropped without routing once the stream
    /// has completed.
    pub fn complete(&self, result: Fallible<S>) {
        self.dispatch(ProxyEvent::Complete(result));
    }

    /// Routes a [`Error::Cancelled`] terminal intent.
    pub fn cancel(&self) {
        self.complete(Err(Error::Cancelled));
    }

    /// True once the backing stream has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.backing.is_completed()
    }

    fn dispatch(&self, event: ProxyEvent<U, S>) {
        if self.backing.is_completed() {
            return;
        }
        let route = Arc::clone(&self.route);
        let backing = self.backing.clone();
        self.executor
            .execute(move || route(event, &backing));
    }
}

impl<U, S> core::fmt::Debug for ProducerProxy<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProducerProxy")
            .field("completed", &self.backing.is_completed())
            .finish()
    }
}
