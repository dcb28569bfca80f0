//! Process Pool - Round-Robin Dispatch over a Fixed Set of Processors
//!
//! The pool owns a fixed number of [`EventProcessor`]s, created up front and
//! started lazily: the first spawn assigned to a processor starts its loop.
//! The process-wide pool returned by [`ProcessPool::global`] is sized from
//! the environment on first use and lives until the hosting process exits.

use crate::config::PoolConfig;
use crate::error::SpawnError;
use crate::processor::EventProcessor;
use crate::stats::PoolStatsSnapshot;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

static GLOBAL: OnceLock<ProcessPool> = OnceLock::new();

struct PoolInner {
    config: PoolConfig,
    processors: Vec<Arc<EventProcessor>>,
    cursor: AtomicUsize,
}

/// A fixed-size set of event processors. Cheap to clone.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    /// Build a pool of [`PoolConfig::worker_count`] processors. No worker
    /// thread is started until the first spawn.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let workers = config.worker_count();
        let processors = (0..workers)
            .map(|id| {
                EventProcessor::new(id, &config)
                    .with_context(|| format!("Failed to create readiness context for processor {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(processors = workers, buffer_capacity = config.buffer_capacity, "Process pool created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                processors,
                cursor: AtomicUsize::new(0),
            }),
        })
    }

    /// The process-wide pool, configured from the environment on first use.
    ///
    /// # Panics
    /// If the readiness contexts cannot be created on first use.
    pub fn global() -> &'static ProcessPool {
        GLOBAL.get_or_init(|| match ProcessPool::new(PoolConfig::from_env()) {
            Ok(pool) => pool,
            Err(err) => panic!("procplex: cannot initialise the global process pool: {err:#}"),
        })
    }

    /// Pick the next processor round-robin, starting its loop if this is the
    /// first spawn it receives.
    pub fn assign_processor(&self) -> Result<Arc<EventProcessor>, SpawnError> {
        let processors = &self.inner.processors;
        let slot = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % processors.len();
        let processor = &processors[slot];

        if processor.check_and_set_running() {
            processor
                .start()
                .map_err(|source| SpawnError::Processor { source })?;
            debug!(processor = slot, "Started event processor loop");
        }
        Ok(Arc::clone(processor))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of processors in the pool.
    pub fn len(&self) -> usize {
        self.inner.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.processors.is_empty()
    }

    pub fn processors(&self) -> &[Arc<EventProcessor>] {
        &self.inner.processors
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot::from_processors(
            self.inner
                .processors
                .iter()
                .map(|p| p.stats().snapshot())
                .collect(),
        )
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("processors", &self.inner.processors)
            .field("config", &self.inner.config)
            .finish()
    }
}
