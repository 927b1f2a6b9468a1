//! Bidirectional stream binding with echo suppression.
//!
//! [`double_bind`] connects two streams so a value observed on either side
//! is forwarded to the other, optionally through a transform per direction.
//! Each side keeps a revision counter under one mutex; a side that is not
//! behind advances its revision and forwards, a side that is behind merely
//! catches up and swallows the value. The reflected copy of a forwarded
//! value arrives behind and is swallowed, so values do not circulate. Side A
//! starts one revision ahead, winning the very first synchronization; a
//! genuinely racing pair of updates may cost the losing side its value or
//! let a tie re-admit a stale one, after which the binder settles again.
//!
//! The revision decision happens while holding the binder mutex; the
//! forward happens after releasing it, so the inline echo path re-entering
//! the binder cannot deadlock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Producer;
use crate::executor::Executor;
use crate::subscription::Subscription;

struct BindState {
    rev_a: u64,
    rev_b: u64,
}

/// Installed two-way binding. Dropping it unbinds both sides.
///
/// While installed, the binding holds a producer handle on each side, so
/// neither stream can be completed by abandonment. Terminal events are not
/// forwarded; a side that completes simply stops participating.
#[must_use = "dropping a Binding immediately unbinds both sides"]
#[derive(Debug)]
pub struct Binding {
    _a: Subscription,
    _b: Subscription,
}

impl Binding {
    /// Removes both forwarding handlers.
    pub fn unbind(self) {}
}

/// Binds two streams of the same update type; values pass through
/// unchanged.
pub fn double_bind<T, SA, SB>(a: &Producer<T, SA>, b: &Producer<T, SB>) -> Binding
where
    T: Clone + Send + 'static,
    SA: Clone + Send + 'static,
    SB: Clone + Send + 'static,
{
    double_bind_with(a, b, |value| value, |value| value)
}

/// Binds two streams through one transform per direction.
pub fn double_bind_with<A, SA, B, SB, AB, BA>(
    a: &Producer<A, SA>,
    b: &Producer<B, SB>,
    a_to_b: AB,
    b_to_a: BA,
) -> Binding
where
    A: Clone + Send + 'static,
    SA: Clone + Send + 'static,
    B: Clone + Send + 'static,
    SB: Clone + Send + 'static,
    AB: Fn(A) -> B + Send + Sync + 'static,
    BA: Fn(B) -> A + Send + Sync + 'static,
{
    // A one ahead of B hands A the first synchronization.
    let state = Arc::new(Mutex::new(BindState { rev_a: 1, rev_b: 0 }));

    let forward = b.clone();
    let decide = Arc::clone(&state);
    let sub_a = a.channel().on_update(&Executor::immediate(), move |value| {
        let winning = {
            let mut state = decide.lock();
            if state.rev_a >= state.rev_b {
                state.rev_a += 1;
                true
            } else {
                state.rev_a = state.rev_b;
                false
            }
        };
        if winning {
            forward.update(a_to_b(value));
        }
    });

    let forward = a.clone();
    let decide = state;
    let sub_b = b.channel().on_update(&Executor::immediate(), move |value| {
        let winning = {
            let mut state = decide.lock();
            if state.rev_b >= state.rev_a {
                state.rev_b += 1;
                true
            } else {
                state.rev_b = state.rev_a;
                false
            }
        };
        if winning {
            forward.update(b_to_a(value));
        }
    });

    Binding {
        _a: sub_a,
        _b: sub_b,
    }
}
