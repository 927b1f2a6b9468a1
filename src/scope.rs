//! Scope-lifetime signaling.
//!
//! An [`ExecutionContext`] is anything with an executor and a teardown
//! moment. Work that must not outlive its owner registers against the
//! context: dependents fail with [`Error::ScopeDropped`] at teardown, which
//! callers can tell apart from an explicit
//! [`Error::Cancelled`](crate::Error::Cancelled).
//!
//! [`Scope`] is the plain owned implementation. It additionally keeps
//! arbitrary resources alive until teardown via [`Scope::retain`].

use std::any::Any;
use std::mem;

use parking_lot::Mutex;

use crate::error::Error;
use crate::eventual::Completable;
use crate::executor::Executor;
use crate::tracing_compat::trace;

/// An executor paired with a teardown moment.
pub trait ExecutionContext {
    /// Executor this context runs its work on.
    fn executor(&self) -> &Executor;

    /// Registers an action to run exactly once at teardown.
    fn on_deinit(&self, action: Box<dyn FnOnce() + Send>);

    /// Ties a completable's fate to the context: teardown fails it with
    /// [`Error::ScopeDropped`] unless it completed first.
    fn add_dependent<C>(&self, completable: &C)
    where
        C: Completable + Clone,
        Self: Sized,
    {
        let target = completable.clone();
        self.on_deinit(Box::new(move || {
            let _ = target.fail(Error::ScopeDropped);
        }));
    }
}

#[derive(Default)]
struct ScopeState {
    deinit: Vec<Box<dyn FnOnce() + Send>>,
    retained: Vec<Box<dyn Any + Send>>,
}

/// Owned execution context.
///
/// Dropping the scope runs the deinit actions in registration order, then
/// drops the retained resources.
pub struct Scope {
    executor: Executor,
    state: Mutex<ScopeState>,
}

impl Scope {
    /// A scope running its work on `executor`.
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self {
            executor: executor.clone(),
            state: Mutex::new(ScopeState::default()),
        }
    }

    /// Keeps `resource` alive until the scope is dropped.
    pub fn retain(&self, resource: impl Any + Send) {
        self.state.lock().retained.push(Box::new(resource));
    }
}

impl ExecutionContext for Scope {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn on_deinit(&self, action: Box<dyn FnOnce() + Send>) {
        self.state.lock().deinit.push(action);
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let ScopeState { deinit, retained } = mem::take(self.state.get_mut());
        trace!(actions = deinit.len(), "scope tearing down");
        for action in deinit {
            action();
        }
        drop(retained);
    }
}

impl core::fmt::Debug for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scope")
            .field("deinit_actions", &state.deinit.len())
            .field("retained", &state.retained.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::Promise;
    use std::sync::mpsc;

    #[test]
    fn teardown_fails_dependents_with_scope_dropped() {
        let scope = Scope::new(&Executor::immediate());
        let promise: Promise<i32> = Promise::new();
        scope.add_dependent(&promise);

        let eventual = promise.eventual();
        drop(scope);

        let error = eventual.wait().unwrap_err();
        assert!(error.is_scope_dropped());
        assert!(!error.is_cancelled());
    }

    #[test]
    fn completed_dependent_is_untouched_by_teardown() {
        let scope = Scope::new(&Executor::immediate());
        let promise = Promise::new();
        scope.add_dependent(&promise);

        assert!(promise.succeed(3));
        drop(scope);
        assert_eq!(promise.eventual().wait(), Ok(3));
    }

    #[test]
    fn deinit_runs_in_order_before_retained_resources_drop() {
        struct Sentinel(mpsc::Sender<&'static str>);
        impl Drop for Sentinel {
            fn drop(&mut self) {
                let _ = self.0.send("retained");
            }
        }

        let (tx, rx) = mpsc::channel();
        let scope = Scope::new(&Executor::immediate());

        let first = tx.clone();
        scope.on_deinit(Box::new(move || {
            let _ = first.send("first");
        }));
        let second = tx.clone();
        scope.on_deinit(Box::new(move || {
            let _ = second.send("second");
        }));
        scope.retain(Sentinel(tx));

        assert!(rx.try_recv().is_err());
        drop(scope);

        assert_eq!(rx.try_recv(), Ok("first"));
        assert_eq!(rx.try_recv(), Ok("second"));
        assert_eq!(rx.try_recv(), Ok("retained"));
    }

    #[test]
    fn exposes_its_executor() {
        let executor = Executor::serial();
        let scope = Scope::new(&executor);
        assert_eq!(scope.executor().id(), executor.id());
    }

    #[test]
    fn usable_as_a_trait_object() {
        let scope = Scope::new(&Executor::immediate());
        let context: &dyn ExecutionContext = &scope;
        let (tx, rx) = mpsc::channel();
        context.on_deinit(Box::new(move || {
            let _ = tx.send(());
        }));
        context.executor().execute(|| {});
        drop(scope);
        assert!(rx.try_recv().is_ok());
    }
}
