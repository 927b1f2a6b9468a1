//! Freshet: executor-driven eventual values and multicast update streams.
//!
//! # Overview
//!
//! Freshet is a callback-based asynchrony library built around two
//! containers: an [`Eventual`] completes exactly once with a [`Fallible`]
//! result, and a [`Channel`] delivers zero or more ordered updates followed
//! by exactly one terminal result. There is no `async`/`await` and no
//! coroutine suspension; every handler runs wherever its [`Executor`]
//! dictates, and "later" only ever means a deferred invocation.
//!
//! # Core Guarantees
//!
//! - **Exactly-once completion**: the first terminal write wins; every later
//!   attempt is an observable no-op
//! - **Ordered delivery**: each subscriber sees updates FIFO relative to the
//!   producer's call order, terminal last, on any executor including pools
//! - **Bounded replay**: a late subscriber first sees the newest
//!   `buffer_capacity` updates, then live ones, with no gap between
//! - **No silent pending**: dropping the last write handle of an open source
//!   completes it with [`Error::Abandoned`], so nothing waits forever
//! - **Callback hygiene**: user callbacks never run while an engine lock is
//!   held, so subscribing or updating from inside a handler cannot deadlock
//!
//! # Module Structure
//!
//! - [`executor`]: where callbacks run (inline, worker pool, serial queue,
//!   delayed, or custom scheduling functions)
//! - [`error`]: the [`Fallible`] result type and error taxonomy
//! - [`eventual`]: write-once completion engine ([`Eventual`]/[`Promise`])
//! - [`channel`]: bounded-replay multicast streams ([`Channel`]/[`Producer`]),
//!   derived operators, blocking iteration, and routed proxies
//! - [`flatten`]: five policies re-linearizing per-element asynchronous work
//! - [`bind`]: bidirectional binding with echo suppression
//! - [`cancel`]: cooperative cancellation latch
//! - [`scope`]: scope-lifetime signaling and resource retention
//! - [`config`]: process-wide defaults for the shared worker pool

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod bind;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod eventual;
pub mod executor;
pub mod flatten;
mod registry;
pub mod scope;
pub mod subscription;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod tracing_compat;

// Re-exports for convenient access to core types
pub use bind::{double_bind, double_bind_with, Binding};
pub use cancel::CancellationToken;
pub use channel::{BlockingIter, Channel, Event, Producer, ProducerProxy, ProxyEvent};
pub use config::{AlreadyInstalled, Config, PoolConfig};
pub use error::{Error, Fallible};
pub use eventual::{Completable, Eventual, Promise};
pub use executor::{DelayTimer, Executor, ExecutorId, WorkerPool};
pub use flatten::FlattenPolicy;
pub use scope::{ExecutionContext, Scope};
pub use subscription::Subscription;
