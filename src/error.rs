//! Error types shared by every primitive in the crate.
//!
//! All completion slots carry a [`Fallible`] value. [`Error`] is cheaply
//! cloneable so that one failure can fan out to any number of subscribers:
//! arbitrary user errors are stored behind an `Arc` rather than boxed per
//! handler.
//!
//! # Taxonomy
//!
//! - [`Error::Cancelled`]: a [`CancellationToken`](crate::CancellationToken)
//!   fired before completion.
//! - [`Error::ScopeDropped`]: the owning [`Scope`](crate::Scope) was dropped
//!   before completion. Distinct from `Cancelled` so callers can tell an
//!   explicit cancel from lifetime teardown.
//! - [`Error::Abandoned`]: every write handle (`Promise` or `Producer`) was
//!   dropped while the slot was still pending. Nothing will ever complete it,
//!   so the engine completes it with this failure instead of leaving waiters
//!   parked forever.
//! - [`Error::CastFailed`]: a dynamic downcast of a type-erased success value
//!   did not match.
//! - [`Error::User`] / [`Error::Message`]: failures produced by user closures.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used by every completion slot in the crate.
pub type Fallible<T> = Result<T, Error>;

/// Failure value delivered through promises, channels, and derived streams.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The owning scope was dropped before the operation completed.
    #[error("owning scope dropped before completion")]
    ScopeDropped,

    /// Every write handle was dropped while the slot was still pending.
    #[error("all write handles dropped without completing")]
    Abandoned,

    /// A dynamic cast of a type-erased success value failed.
    #[error("dynamic cast of success value failed")]
    CastFailed,

    /// An ad-hoc failure message from a user closure.
    #[error("{0}")]
    Message(Arc<str>),

    /// An arbitrary user error.
    #[error(transparent)]
    User(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error value.
    pub fn user<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::User(Arc::new(error))
    }

    /// Builds an ad-hoc failure from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(Arc::from(message.into().into_boxed_str()))
    }

    /// Returns true if this failure came from a cancellation token.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this failure came from a scope being dropped.
    #[must_use]
    pub const fn is_scope_dropped(&self) -> bool {
        matches!(self, Self::ScopeDropped)
    }

    /// Returns true if every write handle was dropped while pending.
    #[must_use]
    pub const fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }

    /// Returns true if a dynamic success-value cast failed.
    #[must_use]
    pub const fn is_cast_failed(&self) -> bool {
        matches!(self, Self::CastFailed)
    }

    /// Returns true for any of the lifecycle failures (`Cancelled`,
    /// `ScopeDropped`, `Abandoned`) as opposed to failures produced by user
    /// code.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ScopeDropped | Self::Abandoned)
    }

    /// Attempts to view the wrapped user error as a concrete type.
    #[must_use]
    pub fn user_cause<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::User(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

// Kind equality; `User` payloads compare by identity since arbitrary error
// types carry no equality of their own.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled, Self::Cancelled)
            | (Self::ScopeDropped, Self::ScopeDropped)
            | (Self::Abandoned, Self::Abandoned)
            | (Self::CastFailed, Self::CastFailed) => true,
            (Self::Message(a), Self::Message(b)) => a == b,
            (Self::User(a), Self::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
