//! Re-linearization of per-element asynchronous work.
//!
//! [`Channel::flat_map`] starts one task per source update through a
//! transform returning an [`Eventual`], and folds the concurrently
//! resolving results back into a single output stream. The
//! [`FlattenPolicy`] picks the concurrency and ordering contract.
//!
//! All bookkeeping lives under one mutex; the emit-or-drop decision is made
//! while holding it, and decided events are deposited into an emit queue
//! drained by one thread at a time after the lock is released. The deposit
//! and the drain hand-off happen in the same critical section as the
//! decision, so emission order matches decision order even when completions
//! race on different threads, and user code never runs inside the engine's
//! critical section.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Channel, Event, Producer};
use crate::error::Fallible;
use crate::eventual::Eventual;
use crate::executor::Executor;
use crate::tracing_compat::trace;

/// Concurrency and ordering contract for [`Channel::flat_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenPolicy {
    /// One task in flight; elements queue; output in input order.
    Serial,
    /// Unbounded tasks; a reorder buffer releases results in input order,
    /// holding completed stragglers until the head of the queue resolves.
    OrderResults,
    /// Unbounded tasks; only the most recently started task's result is
    /// emitted. Stale completions are dropped by an identity check.
    KeepLatest,
    /// Unbounded tasks; completing task `k` discards every still-pending
    /// task started before `k`. Output stays in input order but may skip
    /// elements whose results lost the race.
    DropOutOfOrder,
    /// Unbounded tasks; each result is emitted the instant it resolves.
    KeepUnordered,
}

struct ReorderSlot<T> {
    index: u64,
    result: Option<Fallible<T>>,
}

struct FlattenState<U, T, S> {
    next_index: u64,
    serial_busy: bool,
    queued: VecDeque<U>,
    reorder: VecDeque<ReorderSlot<T>>,
    latest: Option<u64>,
    pending: VecDeque<u64>,
    emit_queue: VecDeque<Event<Fallible<T>, S>>,
    emitting: bool,
}

impl<U, T, S> FlattenState<U, T, S> {
    fn new() -> Self {
        Self {
            next_index: 0,
            serial_busy: false,
            queued: VecDeque::new(),
            reorder: VecDeque::new(),
            latest: None,
            pending: VecDeque::new(),
            emit_queue: VecDeque::new(),
            emitting: false,
        }
    }

    /// True when the caller just became the emitter. Everyone else leaves
    /// deposits behind for the active drainer, which cannot miss them: the
    /// flag only clears under the same lock deposits are made under.
    fn claim_drainer(&mut self) -> bool {
        if self.emitting || self.emit_queue.is_empty() {
            false
        } else {
            self.emitting = true;
            true
        }
    }
}

struct FlattenEngine<U, T, S> {
    policy: FlattenPolicy,
    executor: Executor,
    transform: Box<dyn Fn(U) -> Fallible<Eventual<T>> + Send + Sync>,
    output: Producer<Fallible<T>, S>,
    state: Mutex<FlattenState<U, T, S>>,
}

impl<U, T, S> FlattenEngine<U, T, S>
where
    U: Clone + Send + 'static,
    T: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    fn on_source_event(self: &Arc<Self>, event: Event<U, S>) {
        match event {
            Event::Update(value) => self.on_source_update(value),
            Event::Completion(result) => {
                // The source terminal passes through ahead of undecided
                // work: clearing the bookkeeping makes in-flight tasks
                // resolve into nothing, while results already in the emit
                // queue drain first, in decision order.
                let drain = {
                    let mut state = self.state.lock();
                    state.queued.clear();
                    state.reorder.clear();
                    state.pending.clear();
                    state.latest = None;
                    state.emit_queue.push_back(Event::Completion(result));
                    state.claim_drainer()
                };
                if drain {
                    self.drain_emissions();
                }
            }
        }
    }

    /// Runs on the flatten executor via the source subscription, so the
    /// transform of an immediately-started task runs there too.
    fn on_source_update(self: &Arc<Self>, value: U) {
        if self.policy == FlattenPolicy::Serial {
            let to_start = {
                let mut state = self.state.lock();
                if state.serial_busy {
                    state.queued.push_back(value);
                    None
                } else {
                    state.serial_busy = true;
                    Some(value)
                }
            };
            if let Some(value) = to_start {
                self.start_serial_task(value);
            }
            return;
        }

        let index = {
            let mut state = self.state.lock();
            let index = state.next_index;
            state.next_index += 1;
            match self.policy {
                FlattenPolicy::OrderResults => state.reorder.push_back(ReorderSlot {
                    index,
                    result: None,
                }),
                FlattenPolicy::KeepLatest => state.latest = Some(index),
                FlattenPolicy::DropOutOfOrder => state.pending.push_back(index),
                FlattenPolicy::KeepUnordered | FlattenPolicy::Serial => {}
            }
            index
        };
        self.start_indexed_task(index, value);
    }

    fn start_indexed_task(self: &Arc<Self>, index: u64, value: U) {
        match (self.transform)(value) {
            Ok(task) => {
                let engine = Arc::clone(self);
                task.on_completion(&Executor::immediate(), move |result| {
                    engine.task_completed(index, result);
                })
                .detach();
            }
            // A transform failure is an immediately-failed task in the
            // slot it was assigned.
            Err(error) => self.task_completed(index, Err(error)),
        }
    }

    fn start_serial_task(self: &Arc<Self>, value: U) {
        match (self.transform)(value) {
            Ok(task) => {
                let engine = Arc::clone(self);
                task.on_completion(&Executor::immediate(), move |result| {
                    engine.serial_task_completed(result);
                })
                .detach();
            }
            Err(error) => self.serial_task_completed(Err(error)),
        }
    }

    fn serial_task_completed(self: &Arc<Self>, result: Fallible<T>) {
        let (next, drain) = {
            let mut state = self.state.lock();
            state.emit_queue.push_back(Event::Update(result));
            let next = state.queued.pop_front();
            if next.is_none() {
                state.serial_busy = false;
            }
            (next, state.claim_drainer())
        };
        if drain {
            self.drain_emissions();
        }
        if let Some(next) = next {
            let engine = Arc::clone(self);
            self.executor.execute(move || engine.start_serial_task(next));
        }
    }

    fn task_completed(&self, index: u64, result: Fallible<T>) {
        let mut dropped = false;
        let drain = {
            let mut state = self.state.lock();
            match self.policy {
                FlattenPolicy::OrderResults => {
                    if let Some(slot) =
                        state.reorder.iter_mut().find(|slot| slot.index == index)
                    {
                        slot.result = Some(result);
                    }
                    while state
                        .reorder
                        .front()
                        .is_some_and(|slot| slot.result.is_some())
                    {
                        if let Some(ReorderSlot {
                            result: Some(head), ..
                        }) = state.reorder.pop_front()
                        {
                            state.emit_queue.push_back(Event::Update(head));
                        }
                    }
                }
                FlattenPolicy::KeepLatest => {
                    if state.latest == Some(index) {
                        state.emit_queue.push_back(Event::Update(result));
                    } else {
                        dropped = true;
                    }
                }
                FlattenPolicy::DropOutOfOrder => {
                    let mut matched = false;
                    while let Some(&front) = state.pending.front() {
                        if front > index {
                            break;
                        }
                        state.pending.pop_front();
                        if front == index {
                            matched = true;
                            break;
                        }
                        // An earlier, still-pending entry just got passed
                        // over; its eventual result will be dropped too.
                    }
                    if matched {
                        state.emit_queue.push_back(Event::Update(result));
                    } else {
                        dropped = true;
                    }
                }
                FlattenPolicy::KeepUnordered => {
                    state.emit_queue.push_back(Event::Update(result));
                }
                // Serial results never come through the indexed path.
                FlattenPolicy::Serial => {}
            }
            state.claim_drainer()
        };
        if dropped {
            trace!(index, "flatten result dropped by policy");
        }
        if drain {
            self.drain_emissions();
        }
    }

    /// Feeds deposited events to the output, one at a time, outside the
    /// state lock. Exactly one drainer runs at a time; deposits made while
    /// it runs are picked up before it exits.
    fn drain_emissions(&self) {
        loop {
            let event = {
                let mut state = self.state.lock();
                match state.emit_queue.pop_front() {
                    Some(event) => event,
                    None => {
                        state.emitting = false;
                        return;
                    }
                }
            };
            match event {
                Event::Update(result) => self.output.update(result),
                Event::Completion(result) => {
                    let _ = self.output.try_complete(result);
                }
            }
        }
    }
}

impl<U, S> Channel<U, S>
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Starts one asynchronous task per update through `transform` and
    /// re-linearizes the results into a single stream of [`Fallible`]
    /// values under `policy`.
    ///
    /// `transform` runs on `executor`; an `Err` return is an
    /// immediately-failed task occupying the slot it was assigned. The
    /// source terminal passes through to the output as soon as it arrives,
    /// independent of in-flight tasks, and the output inherits the source's
    /// buffer capacity.
    pub fn flat_map<T, F>(
        &self,
        policy: FlattenPolicy,
        executor: &Executor,
        transform: F,
    ) -> Channel<Fallible<T>, S>
    where
        T: Clone + Send + 'static,
        F: Fn(U) -> Fallible<Eventual<T>> + Send + Sync + 'static,
    {
        let engine = Arc::new(FlattenEngine {
            policy,
            executor: executor.clone(),
            transform: Box::new(transform),
            output: Producer::new(self.buffer_capacity()),
            state: Mutex::new(FlattenState::new()),
        });
        let output = engine.output.channel();
        let feed = Arc::clone(&engine);
        self.subscribe(executor, move |event| feed.on_source_event(event))
            .detach();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Producer;
    use crate::error::Error;
    use crate::eventual::Promise;
    use std::sync::mpsc;
    use std::time::Duration;

    type TaskBook = Arc<Mutex<Vec<(i32, Promise<i32>)>>>;

    /// Transform whose tasks complete only when the test says so.
    fn tracked_transform() -> (TaskBook, impl Fn(i32) -> Fallible<Eventual<i32>>) {
        let book: TaskBook = Arc::new(Mutex::new(Vec::new()));
        let recording = Arc::clone(&book);
        let transform = move |input: i32| {
            let promise = Promise::new();
            let eventual = promise.eventual();
            recording.lock().push((input, promise));
            Ok(eventual)
        };
        (book, transform)
    }

    fn started(book: &TaskBook) -> Vec<i32> {
        book.lock().iter().map(|(input, _)| *input).collect()
    }

    fn resolve(book: &TaskBook, input: i32, result: i32) {
        let promise = book
            .lock()
            .iter()
            .find(|(n, _)| *n == input)
            .map(|(_, p)| p.clone())
            .expect("task was started");
        promise.succeed(result);
    }

    fn collect_output<S>(channel: &Channel<Fallible<i32>, S>) -> mpsc::Receiver<Event<Fallible<i32>, S>>
    where
        S: Clone + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        channel
            .subscribe(&Executor::immediate(), move |event| {
                let _ = tx.send(event);
            })
            .detach();
        rx
    }

    fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    fn no_event<T>(rx: &mpsc::Receiver<T>) {
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn serial_runs_one_task_and_queues_the_rest() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output =
            source
                .channel()
                .flat_map(FlattenPolicy::Serial, &Executor::immediate(), transform);
        let rx = collect_output(&output);

        source.update_many([1, 2, 3]);
        assert_eq!(started(&book), vec![1]);

        resolve(&book, 1, 10);
        assert_eq!(recv(&rx), Event::Update(Ok(10)));
        assert_eq!(started(&book), vec![1, 2]);

        resolve(&book, 2, 20);
        assert_eq!(recv(&rx), Event::Update(Ok(20)));
        resolve(&book, 3, 30);
        assert_eq!(recv(&rx), Event::Update(Ok(30)));

        source.succeed(());
        assert_eq!(recv(&rx), Event::Completion(Ok(())));
    }

    #[test]
    fn order_results_holds_stragglers_for_the_head() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::OrderResults,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update_many([1, 2, 3]);
        assert_eq!(started(&book), vec![1, 2, 3]);

        resolve(&book, 2, 20);
        no_event(&rx);

        resolve(&book, 1, 10);
        assert_eq!(recv(&rx), Event::Update(Ok(10)));
        assert_eq!(recv(&rx), Event::Update(Ok(20)));

        resolve(&book, 3, 30);
        assert_eq!(recv(&rx), Event::Update(Ok(30)));
    }

    #[test]
    fn keep_latest_emits_only_the_newest_task() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::KeepLatest,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update_many([1, 2, 3]);

        resolve(&book, 1, 10);
        no_event(&rx);
        resolve(&book, 3, 30);
        assert_eq!(recv(&rx), Event::Update(Ok(30)));
        resolve(&book, 2, 20);
        no_event(&rx);
    }

    #[test]
    fn drop_out_of_order_discards_overtaken_tasks() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::DropOutOfOrder,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update_many([1, 2, 3]);

        // Task 2 finishes first and passes over still-pending task 1.
        resolve(&book, 2, 20);
        assert_eq!(recv(&rx), Event::Update(Ok(20)));

        resolve(&book, 1, 10);
        no_event(&rx);

        resolve(&book, 3, 30);
        assert_eq!(recv(&rx), Event::Update(Ok(30)));
    }

    #[test]
    fn keep_unordered_emits_in_completion_order() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::KeepUnordered,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update_many([1, 2, 3]);

        resolve(&book, 2, 20);
        resolve(&book, 3, 30);
        resolve(&book, 1, 10);

        assert_eq!(recv(&rx), Event::Update(Ok(20)));
        assert_eq!(recv(&rx), Event::Update(Ok(30)));
        assert_eq!(recv(&rx), Event::Update(Ok(10)));
    }

    #[test]
    fn transform_failure_is_an_immediately_failed_task() {
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::OrderResults,
            &Executor::immediate(),
            |n| {
                if n == 1 {
                    Err(Error::message("refused"))
                } else {
                    Ok(Eventual::succeeded(n * 10))
                }
            },
        );
        let rx = collect_output(&output);

        source.update_many([1, 2]);

        match recv(&rx) {
            Event::Update(Err(error)) => assert_eq!(error.to_string(), "refused"),
            other => panic!("expected failed slot, got {other:?}"),
        }
        assert_eq!(recv(&rx), Event::Update(Ok(20)));
    }

    #[test]
    fn source_terminal_passes_through_ahead_of_pending_tasks() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32, &str>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::KeepUnordered,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update(1);
        source.succeed("done");
        assert_eq!(recv(&rx), Event::Completion(Ok("done")));

        // The straggler resolves into a completed stream and vanishes.
        resolve(&book, 1, 10);
        no_event(&rx);
    }

    #[test]
    fn abandoned_task_surfaces_as_failed_result() {
        let (book, transform) = tracked_transform();
        let source = Producer::<i32>::new(0);
        let output = source.channel().flat_map(
            FlattenPolicy::KeepUnordered,
            &Executor::immediate(),
            transform,
        );
        let rx = collect_output(&output);

        source.update(1);
        book.lock().clear();

        match recv(&rx) {
            Event::Update(Err(error)) => assert!(error.is_abandoned()),
            other => panic!("expected abandoned task, got {other:?}"),
        }
    }

    #[test]
    fn output_inherits_source_buffer_capacity() {
        let source = Producer::<i32>::new(5);
        let output = source.channel().flat_map(
            FlattenPolicy::KeepUnordered,
            &Executor::immediate(),
            |n| Ok(Eventual::succeeded(n)),
        );
        assert_eq!(output.buffer_capacity(), 5);
    }
}
