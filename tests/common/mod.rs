#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use freshet::{Channel, Event, Executor, Fallible, Subscription};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::mpsc;
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

/// How long collectors wait for a cross-thread delivery before declaring the
/// stream stalled.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

const PROPTEST_SEED_ENV: &str = "FRESHET_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "FRESHET_PROPTEST_MAX_SHRINK_ITERS";

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }

    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }

    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Routes every event of `channel` into an mpsc receiver, preserving
/// delivery order.
pub fn collect_events<U, S>(channel: &Channel<U, S>) -> (Subscription, mpsc::Receiver<Event<U, S>>)
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let sub = channel.subscribe(&Executor::immediate(), move |event| {
        let _ = tx.send(event);
    });
    (sub, rx)
}

/// Routes just the updates of `channel` into an mpsc receiver.
pub fn collect_updates<U, S>(channel: &Channel<U, S>) -> (Subscription, mpsc::Receiver<U>)
where
    U: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let sub = channel.on_update(&Executor::immediate(), move |value| {
        let _ = tx.send(value);
    });
    (sub, rx)
}

/// Receives exactly `n` items, panicking when the stream stalls first.
pub fn recv_n<T>(rx: &mpsc::Receiver<T>, n: usize) -> Vec<T> {
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(item) => out.push(item),
            Err(err) => panic!("stream stalled after {} of {n} items: {err}", out.len()),
        }
    }
    out
}

/// Drains whatever is queued right now without waiting.
pub fn drain_now<T>(rx: &mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Drains until the receiver has stayed quiet for `quiet`.
pub fn drain_until_quiet<T>(rx: &mpsc::Receiver<T>, quiet: Duration) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.recv_timeout(quiet) {
        out.push(item);
    }
    out
}

/// Panics when anything arrives within a short settling window.
pub fn assert_quiet<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>) {
    if let Ok(item) = rx.recv_timeout(Duration::from_millis(50)) {
        panic!("expected no further deliveries, got {item:?}");
    }
}

/// Splits a delivery log into updates and the terminal, panicking when
/// anything was delivered after the terminal.
pub fn split_events<U, S>(events: Vec<Event<U, S>>) -> (Vec<U>, Option<Fallible<S>>)
where
    U: std::fmt::Debug,
    S: std::fmt::Debug,
{
    let mut updates = Vec::new();
    let mut completion = None;
    for event in events {
        assert!(
            completion.is_none(),
            "event delivered after the terminal: {event:?}"
        );
        match event {
            Event::Update(value) => updates.push(value),
            Event::Completion(result) => completion = Some(result),
        }
    }
    (updates, completion)
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
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

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
