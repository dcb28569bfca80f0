//! Pool Configuration - Worker Count and Buffer Tunables
//!
//! The process pool is sized once, from the environment, the first time the
//! global pool is touched. Explicitly constructed pools take a `PoolConfig`
//! directly and never look at the environment.
//!
//! # Environment:
//! - `PROCPLEX_THREADS`: number of event-processor threads (positive integer)
//! - `PROCPLEX_THREADS_EQUAL_CORES`: one processor per available execution unit
//! - `PROCPLEX_BUFFER_CAPACITY`: per-process stdin/stdout buffer size in bytes

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable selecting the worker pool size.
pub const ENV_THREADS: &str = "PROCPLEX_THREADS";

/// Environment variable selecting one worker per available execution unit.
pub const ENV_THREADS_EQUAL_CORES: &str = "PROCPLEX_THREADS_EQUAL_CORES";

/// Environment variable overriding the per-process buffer capacity.
pub const ENV_BUFFER_CAPACITY: &str = "PROCPLEX_BUFFER_CAPACITY";

/// Default capacity in bytes of each per-process I/O buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Smallest buffer capacity accepted from the environment.
const MIN_BUFFER_CAPACITY: usize = 512;

/// Configuration for a [`ProcessPool`](crate::pool::ProcessPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Explicit number of event processors. `None` falls back to
    /// `threads_equal_cores`, then to a single processor.
    pub threads: Option<usize>,
    /// Size the pool to the number of available execution units.
    pub threads_equal_cores: bool,
    /// Capacity of the stdout/stderr read buffer and of the stdin buffer.
    pub buffer_capacity: usize,
    /// Interval between full reaping sweeps over every registered process.
    pub housekeeping_interval: Duration,
    /// Interval between reap attempts for processes whose output has closed.
    pub reap_interval: Duration,
    /// Maximum readiness events collected per wake-up.
    pub max_events: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: None,
            threads_equal_cores: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            housekeeping_interval: Duration::from_millis(1000),
            reap_interval: Duration::from_millis(10),
            max_events: 64,
        }
    }
}

impl PoolConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Values that fail to parse are logged and ignored, leaving the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_THREADS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.threads = Some(n),
                _ => warn!(var = ENV_THREADS, value = %raw, "Ignoring invalid thread count"),
            }
        }

        if let Some(raw) = lookup(ENV_THREADS_EQUAL_CORES) {
            match parse_bool(&raw) {
                Some(flag) => config.threads_equal_cores = flag,
                None => warn!(var = ENV_THREADS_EQUAL_CORES, value = %raw, "Ignoring invalid boolean"),
            }
        }

        if let Some(raw) = lookup(ENV_BUFFER_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n >= MIN_BUFFER_CAPACITY => config.buffer_capacity = n,
                _ => warn!(var = ENV_BUFFER_CAPACITY, value = %raw, "Ignoring invalid buffer capacity"),
            }
        }

        debug!(?config, "Resolved pool configuration");
        config
    }

    /// Number of event processors this configuration asks for (at least one).
    pub fn worker_count(&self) -> usize {
        let count = match self.threads {
            Some(n) => n,
            None if self.threads_equal_cores => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            None => 1,
        };
        count.max(1)
    }

    /// Configuration with an explicit processor count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
