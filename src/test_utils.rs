//! Shared helpers for unit tests: logging initialization and phase macros.
//!
//! Only compiled into test builds. Integration suites under `tests/` carry
//! their own copy of these helpers since they link the crate externally.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initializes trace-level test logging. The first call wins; later calls
/// are no-ops.
pub(crate) fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Logs a test phase transition with a visual separator.
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "==== TEST PHASE: {} ====", $name);
    };
}
pub(crate) use test_phase;

/// Logs test completion with an optional summary.
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}
pub(crate) use test_complete;

/// Logs expected and actual values before asserting.
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
pub(crate) use assert_with_log;
