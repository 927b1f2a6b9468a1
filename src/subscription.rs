//! RAII handle tying a registered handler to its subscriber.
//!
//! Every subscribe operation returns a [`Subscription`]. Dropping it removes
//! the handler from the source's registry; [`Subscription::detach`] leaves
//! the handler installed for as long as the source lives (or until the
//! terminal event drains it). Subscribing to an already-completed source
//! yields an inert handle, since no handler was retained.

/// Handle to one registered handler.
///
/// The handle owns the unsubscribe action. It is `Send` and `Sync`, so a
/// subscriber may park it on another thread, share it behind an `Arc`, or
/// retain it inside a [`Scope`](crate::Scope).
#[must_use = "dropping a Subscription immediately unsubscribes; call detach() to keep the handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Builds a subscription whose drop runs `cancel`.
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Builds a handle with nothing to unsubscribe.
    pub(crate) const fn inert() -> Self {
        Self { cancel: None }
    }

    /// Consumes the handle without unsubscribing.
    ///
    /// The handler then stays installed until the source delivers its
    /// terminal event or is dropped.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
