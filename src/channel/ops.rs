//! Derived streams: every operator here is a producer fed by a subscription
//! on its source.
//!
//! The shared shape: open a new [`Producer`] with the source's buffer
//! capacity, subscribe a handler on the caller's executor that feeds it, and
//! detach the subscription so the chain lives until the source terminates.
//! The terminal result always passes through unchanged; when the source is
//! abandoned, so is the derived stream.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Channel, Event, Producer};
use crate::error::Fallible;
use crate::eventual::{Eventual, Promise};
use crate::executor::{DelayTimer, Executor};

impl<U, S> Channel<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    fn derive<R, F>(&self, executor: &Executor, on_event: F) -> Channel<R, S>
    where
        R: Clone + Send + 'static,
        F: Fn(Event<U, S>, &Producer<R, S>) + Send + Sync + 'static,
    {
        let producer = Producer::<R, S>::new(self.buffer_capacity());
        let derived = producer.channel();
        self.subscribe(executor, move |event| on_event(event, &producer))
            .detach();
        derived
    }

    /// Stream of `f(update)`, transformed on `executor`.
    pub fn map<R, F>(&self, executor: &Executor, f: F) -> Channel<R, S>
    where
        R: Clone + Send + 'static,
        F: Fn(U) -> R + Send + Sync + 'static,
    {
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => out.update(f(value)),
            Event::Completion(result) => {
                let _ = out.try_complete(result);
            }
        })
    }

    /// Stream of the updates `keep` accepts.
    pub fn filter<F>(&self, executor: &Executor, keep: F) -> Channel<U, S>
    where
        F: Fn(&U) -> bool + Send + Sync + 'static,
    {
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => {
                if keep(&value) {
                    out.update(value);
                }
            }
            Event::Completion(result) => {
                let _ = out.try_complete(result);
            }
        })
    }

    /// Stream of `chunk`-sized groups of consecutive updates. A partial
    /// group still pending at the terminal is flushed first.
    pub fn buffer(&self, executor: &Executor, chunk: usize) -> Channel<Vec<U>, S> {
        let chunk = chunk.max(1);
        let pending: Mutex<Vec<U>> = Mutex::new(Vec::new());
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => {
                let full = {
                    let mut pending = pending.lock();
                    pending.push(value);
                    if pending.len() == chunk {
                        Some(mem::take(&mut *pending))
                    } else {
                        None
                    }
                };
                if let Some(group) = full {
                    out.update(group);
                }
            }
            Event::Completion(result) => {
                let rest = mem::take(&mut *pending.lock());
                if !rest.is_empty() {
                    out.update(rest);
                }
                let _ = out.try_complete(result);
            }
        })
    }

    /// Stream that re-emits only the newest update once the source has been
    /// quiet for `quiet`. An update still pending at the terminal is flushed
    /// before the terminal passes through, so the final value is never lost.
    pub fn debounce(&self, executor: &Executor, quiet: Duration) -> Channel<U, S> {
        struct DebounceState<U> {
            seq: u64,
            pending: Option<U>,
        }

        let state = Arc::new(Mutex::new(DebounceState {
            seq: 0,
            pending: None,
        }));
        let fire_on = executor.clone();
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => {
                let my_seq = {
                    let mut state = state.lock();
                    state.seq += 1;
                    state.pending = Some(value);
                    state.seq
                };
                let state = Arc::clone(&state);
                let out = out.clone();
                DelayTimer::shared().schedule_after(quiet, &fire_on, move || {
                    let ripe = {
                        let mut state = state.lock();
                        if state.seq == my_seq {
                            state.pending.take()
                        } else {
                            None
                        }
                    };
                    if let Some(value) = ripe {
                        out.update(value);
                    }
                });
            }
            Event::Completion(result) => {
                let flushed = {
                    let mut state = state.lock();
                    state.seq += 1;
                    state.pending.take()
                };
                if let Some(value) = flushed {
                    out.update(value);
                }
                let _ = out.try_complete(result);
            }
        })
    }

    /// Stream with consecutive duplicate updates suppressed.
    pub fn distinct(&self, executor: &Executor) -> Channel<U, S>
    where
        U: PartialEq,
    {
        let last: Mutex<Option<U>> = Mutex::new(None);
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => {
                let fresh = {
                    let mut last = last.lock();
                    if last.as_ref() == Some(&value) {
                        None
                    } else {
                        *last = Some(value.clone());
                        Some(value)
                    }
                };
                if let Some(value) = fresh {
                    out.update(value);
                }
            }
            Event::Completion(result) => {
                let _ = out.try_complete(result);
            }
        })
    }

    /// Stream of the running accumulator: each update emits
    /// `f(accumulator, update)`.
    pub fn scan<R, F>(&self, executor: &Executor, initial: R, f: F) -> Channel<R, S>
    where
        R: Clone + Send + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
    {
        let acc = Mutex::new(initial);
        self.derive(executor, move |event, out| match event {
            Event::Update(value) => {
                let next = {
                    let mut acc = acc.lock();
                    let next = f(acc.clone(), value);
                    *acc = next.clone();
                    next
                };
                out.update(next);
            }
            Event::Completion(result) => {
                let _ = out.try_complete(result);
            }
        })
    }

    /// Folds the whole stream into one eventual `(accumulator, success)`
    /// pair. A failure terminal fails the fold instead.
    pub fn reduce<R, F>(&self, executor: &Executor, initial: R, f: F) -> Eventual<(R, S)>
    where
        R: Clone + Send + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        let acc: Mutex<Option<R>> = Mutex::new(Some(initial));
        self.subscribe(executor, move |event| match event {
            Event::Update(value) => {
                let mut acc = acc.lock();
                if let Some(current) = acc.take() {
                    *acc = Some(f(current, value));
                }
            }
            Event::Completion(result) => {
                let folded = acc.lock().take();
                let outcome: Fallible<(R, S)> = match result {
                    Ok(success) => match folded {
                        Some(folded) => Ok((folded, success)),
                        // A second terminal cannot arrive; the fold state is
                        // only ever taken here.
                        None => return,
                    },
                    Err(error) => Err(error),
                };
                let _ = target.try_complete(outcome);
            }
        })
        .detach();
        promise.eventual()
    }
}
