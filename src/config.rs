//! Process-wide defaults for the shared executor infrastructure.
//!
//! [`Config`] describes how [`Executor::primary`](crate::Executor::primary)
//! sizes its worker pool. It is installed at most once, before first use,
//! and is immutable afterwards; everything else in the crate takes its
//! executor explicitly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |---|---|
//! | `pool.min_threads` | 1 |
//! | `pool.max_threads` | 2 × available parallelism (at least 4) |
//! | `pool.idle_timeout` | 10 s |
//! | `pool.thread_name_prefix` | `freshet-worker` |
//! | `pool.stack_size` | platform default |

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Sizing and naming for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread floor kept alive once reached; idle workers above it retire.
    pub min_threads: usize,
    /// Hard ceiling on concurrently live worker threads.
    pub max_threads: usize,
    /// How long an idle worker above the floor waits before retiring.
    pub idle_timeout: Duration,
    /// Prefix for worker thread names (`<prefix>-<n>`).
    pub thread_name_prefix: String,
    /// Worker stack size override; `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
        Self {
            min_threads: 1,
            max_threads: (parallelism * 2).max(4),
            idle_timeout: Duration::from_secs(10),
            thread_name_prefix: "freshet-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    /// Clamps the configuration into a usable shape: at least one thread,
    /// floor no higher than ceiling, non-empty name prefix.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
        if self.min_threads > self.max_threads {
            self.min_threads = self.max_threads;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "freshet-worker".to_string();
        }
        self
    }
}

/// Process-wide configuration, read once by the shared infrastructure.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Sizing for the default worker pool.
    pub pool: PoolConfig,
}

/// The configuration was already installed, or the defaults were already
/// taken into use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("configuration already installed or already in use")]
pub struct AlreadyInstalled;

static INSTALLED: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Installs this configuration as the process default.
    ///
    /// Must happen before the first call to
    /// [`Executor::primary`](crate::Executor::primary); once any component
    /// has read the defaults they are frozen.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyInstalled`] when a configuration was installed
    /// earlier or the defaults are already in use.
    pub fn install(self) -> Result<(), AlreadyInstalled> {
        INSTALLED.set(self).map_err(|_| AlreadyInstalled)
    }

    /// The installed configuration, or the defaults on first touch.
    pub(crate) fn installed() -> &'static Self {
        INSTALLED.get_or_init(Self::default)
    }
}
