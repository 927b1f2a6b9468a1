//! Pull-based blocking view of a stream.
//!
//! The iterator subscribes on the immediate executor and appends every event
//! to a shared, append-only log. `next()` parks the calling thread until the
//! cursor can advance. The log is never truncated while an iterator lives,
//! which is what lets [`BlockingIter::clone`] branch the cursor: each clone
//! walks the same history independently.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::{Channel, Event};
use crate::error::Fallible;
use crate::executor::Executor;
use crate::subscription::Subscription;

struct IterLog<U, S> {
    events: Mutex<Vec<Event<U, S>>>,
    grew: Condvar,
}

/// Blocking iterator over a stream's updates.
///
/// Yields each update in delivery order, parking between values, and ends
/// (returns `None`) at the terminal event; [`completion`](Self::completion)
/// then exposes the terminal result. Cloning branches the cursor: both
/// iterators replay from the same logical point without interfering.
///
/// Never drive this from the executor that produces the stream's values; a
/// serial queue waiting on a value scheduled behind the wait deadlocks, and
/// the engine cannot detect it.
pub struct BlockingIter<U, S> {
    log: Arc<IterLog<U, S>>,
    _subscription: Arc<Subscription>,
    cursor: usize,
}

impl<U, S> Channel<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Opens a blocking iterator starting at the currently buffered values.
    #[must_use]
    pub fn blocking_iter(&self) -> BlockingIter<U, S> {
        let log = Arc::new(IterLog {
            events: Mutex::new(Vec::new()),
            grew: Condvar::new(),
        });
        let feed = Arc::clone(&log);
        let subscription = self.subscribe(&Executor::immediate(), move |event| {
            feed.events.lock().push(event);
            feed.grew.notify_all();
        });
        BlockingIter {
            log,
            _subscription: Arc::new(subscription),
            cursor: 0,
        }
    }
}

impl<U, S> BlockingIter<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// The terminal result, once the iterator has yielded `None`.
    ///
    /// `None` while updates remain ahead of the cursor or the stream is
    /// still open.
    #[must_use]
    pub fn completion(&self) -> Option<Fallible<S>> {
        let events = self.log.events.lock();
        match events.get(self.cursor) {
            Some(Event::Completion(result)) => Some(result.clone()),
            _ => None,
        }
    }
}

impl<U, S> Iterator for BlockingIter<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    type Item = U;

    fn next(&mut self) -> Option<U> {
        let mut events = self.log.events.lock();
        loop {
            if let Some(event) = events.get(self.cursor) {
                match event {
                    Event::Update(value) => {
                        let value = value.clone();
                        self.cursor += 1;
                        return Some(value);
                    }
                    // The cursor parks on the terminal so completion()
                    // can read it; nothing is ever appended after it.
                    Event::Completion(_) => return None,
                }
            }
            self.log.grew.wait(&mut events);
        }
    }
}

impl<U, S> Clone for BlockingIter<U, S> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            _subscription: Arc::clone(&self._subscription),
            cursor: self.cursor,
        }
    }
}

impl<U, S> core::fmt::Debug for BlockingIter<U, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingIter")
            .field("cursor", &self.cursor)
            .field("log_len", &self.log.events.lock().len())
            .finish()
    }
}
