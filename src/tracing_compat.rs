//! Logging layer that works with or without the `tracing` ecosystem.
//!
//! Internal diagnostics go through this module so that the crate carries no
//! mandatory logging dependency:
//!
//! - With the `tracing-integration` feature: re-exports from the `tracing`
//!   crate, so events flow to whatever subscriber the host installed.
//! - Without it: the macros expand to nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use freshet::tracing_compat::{debug, trace};
//!
//! debug!(workers = count, "scaling pool");
//! trace!("stale result dropped");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn, Level};

// When tracing is disabled, provide no-op macros.
#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    // Re-export the macros at module level so call sites can import them
    // from `crate::tracing_compat` either way.
    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

/// Log level marker kept API-compatible across both build modes.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Trace-level verbosity.
    Trace,
    /// Debug-level verbosity.
    Debug,
    /// Informational messages.
    Info,
    /// Warnings.
    Warn,
    /// Errors.
    Error,
}
