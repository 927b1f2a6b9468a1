//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a one-way latch. Completables registered with
//! [`add`](CancellationToken::add) fail with [`Error::Cancelled`] when the
//! token fires; actions registered with
//! [`on_cancel`](CancellationToken::on_cancel) run once. Registration after
//! the fact applies immediately, so late registrants cannot miss the signal.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::eventual::Completable;
use crate::tracing_compat::trace;

enum TokenState {
    Active {
        actions: Vec<Box<dyn FnOnce() + Send>>,
    },
    Cancelled,
}

/// Shared cancellation latch. Clones observe and trigger the same token.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    /// A fresh, untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState::Active {
                actions: Vec::new(),
            })),
        }
    }

    /// True once [`cancel`](Self::cancel) has run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.state.lock(), TokenState::Cancelled)
    }

    /// Registers an action to run when the token fires. Runs immediately if
    /// it already has.
    pub fn on_cancel(&self, action: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        match &mut *state {
            TokenState::Active { actions } => actions.push(Box::new(action)),
            TokenState::Cancelled => {
                drop(state);
                action();
            }
        }
    }

    /// Registers a completable to be failed with [`Error::Cancelled`] when
    /// the token fires. Fails it immediately if it already has.
    pub fn add<C>(&self, completable: &C)
    where
        C: Completable + Clone,
    {
        let target = completable.clone();
        self.on_cancel(move || {
            let _ = target.fail(Error::Cancelled);
        });
    }

    /// Fires the token. The first call runs every registered action, outside
    /// the token's lock; later calls are no-ops.
    pub fn cancel(&self) {
        let actions = {
            let mut state = self.state.lock();
            match &mut *state {
                TokenState::Active { actions } => {
                    let actions = mem::take(actions);
                    *state = TokenState::Cancelled;
                    actions
                }
                TokenState::Cancelled => return,
            }
        };
        trace!(actions = actions.len(), "cancellation token fired");
        for action in actions {
            action();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
