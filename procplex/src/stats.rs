//! Processor Statistics
//!
//! Lightweight counters maintained by each event processor, readable from any
//! thread without taking a lock.
//!
//! # Design Goals:
//! - Relaxed atomic counters only; readers see a best-effort snapshot
//! - Zero allocation on the event loop's hot path

use crate::process::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for one event processor.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    registered: AtomicU64,
    exited: AtomicU64,
    abandoned: AtomicU64,
    stdout_bytes: AtomicU64,
    stderr_bytes: AtomicU64,
    stdin_bytes: AtomicU64,
    wakeups: AtomicU64,
    dispatches: AtomicU64,
    dispatch_time_ns: AtomicU64,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exited(&self) {
        self.exited.fetch_add(1, Ordering::Relaxed);
    }

    /// A listener panicked and its process was torn down.
    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, stream: Stream, bytes: usize) {
        let counter = match stream {
            Stream::Stderr => &self.stderr_bytes,
            _ => &self.stdout_bytes,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, bytes: usize) {
        self.stdin_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// One return from the readiness wait.
    pub(crate) fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, duration: Duration) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.dispatch_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Processes currently registered and not yet reaped.
    pub fn active(&self) -> u64 {
        let registered = self.registered.load(Ordering::Relaxed);
        let done = self.exited.load(Ordering::Relaxed);
        registered.saturating_sub(done)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let dispatches = self.dispatches.load(Ordering::Relaxed);
        let avg_dispatch_us = if dispatches == 0 {
            0.0
        } else {
            self.dispatch_time_ns.load(Ordering::Relaxed) as f64 / dispatches as f64 / 1_000.0
        };

        StatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            exited: self.exited.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            stdout_bytes: self.stdout_bytes.load(Ordering::Relaxed),
            stderr_bytes: self.stderr_bytes.load(Ordering::Relaxed),
            stdin_bytes: self.stdin_bytes.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            dispatches,
            avg_dispatch_us,
        }
    }
}

/// A point-in-time copy of one processor's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub exited: u64,
    pub abandoned: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub stdin_bytes: u64,
    pub wakeups: u64,
    pub dispatches: u64,
    pub avg_dispatch_us: f64,
}

impl StatsSnapshot {
    fn accumulate(&mut self, other: &StatsSnapshot) {
        let weighted = self.avg_dispatch_us * self.dispatches as f64
            + other.avg_dispatch_us * other.dispatches as f64;

        self.registered += other.registered;
        self.exited += other.exited;
        self.abandoned += other.abandoned;
        self.stdout_bytes += other.stdout_bytes;
        self.stderr_bytes += other.stderr_bytes;
        self.stdin_bytes += other.stdin_bytes;
        self.wakeups += other.wakeups;
        self.dispatches += other.dispatches;
        self.avg_dispatch_us = if self.dispatches == 0 {
            0.0
        } else {
            weighted / self.dispatches as f64
        };
    }
}

/// Per-processor snapshots plus their totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    pub processors: Vec<StatsSnapshot>,
    pub total: StatsSnapshot,
}

impl PoolStatsSnapshot {
    pub fn from_processors(processors: Vec<StatsSnapshot>) -> Self {
        let mut total = StatsSnapshot::default();
        for snapshot in &processors {
            total.accumulate(snapshot);
        }
        Self { processors, total }
    }
}

impl fmt::Display for PoolStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "procplex pool statistics")?;
        for (id, s) in self.processors.iter().enumerate() {
            writeln!(
                f,
                "  processor {id}: {} started, {} exited, {} abandoned, \
                 out {} B, err {} B, in {} B, {} wakeups",
                s.registered, s.exited, s.abandoned, s.stdout_bytes, s.stderr_bytes, s.stdin_bytes, s.wakeups
            )?;
        }
        let t = &self.total;
        write!(
            f,
            "  total: {} started, {} exited, out {} B, err {} B, in {} B, avg dispatch {:.2} us",
            t.registered, t.exited, t.stdout_bytes, t.stderr_bytes, t.stdin_bytes, t.avg_dispatch_us
        )
    }
}

/// Records the elapsed time of one listener dispatch on drop.
pub(crate) struct DispatchTimer<'a> {
    start: Instant,
    stats: &'a ProcessorStats,
}

impl<'a> DispatchTimer<'a> {
    pub(crate) fn new(stats: &'a ProcessorStats) -> Self {
        Self {
            start: Instant::now(),
            stats,
        }
    }
}

impl Drop for DispatchTimer<'_> {
    fn drop(&mut self) {
        self.stats.record_dispatch(self.start.elapsed());
    }
}
