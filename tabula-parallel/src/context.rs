//! Plan-scoped execution state

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabula_core::budget::MemoryBudget;
use tabula_core::{Error, Result, StorageRef};
use tabula_query::DEFAULT_MAX_ITERATIONS;

use crate::pool::WorkerPool;

/// Execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Number of partitions a materialization is split into
    pub parallelism: usize,

    /// Target rows per batch
    pub batch_size: usize,

    /// Bytes of in-flight batches allowed per query
    pub memory_budget: usize,

    /// Run the optimizer before executing
    pub optimize: bool,

    /// Optimizer sweep cap
    pub optimizer_max_iterations: usize,

    /// Size of the shared worker pool
    pub worker_threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            batch_size: 1024,
            memory_budget: 512 * 1024 * 1024,
            optimize: true,
            optimizer_max_iterations: DEFAULT_MAX_ITERATIONS,
            worker_threads: num_cpus::get(),
        }
    }
}

/// Cooperative cancellation flag; clones share the flag
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Everything a running plan shares: storage, workers, the in-flight
/// memory budget and the cancellation flag. Clones share all of it.
#[derive(Clone)]
pub struct QueryContext {
    storage: StorageRef,
    pool: WorkerPool,
    budget: Arc<MemoryBudget>,
    cancel: CancelHandle,
    config: Arc<ExecutionConfig>,
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("pool", &self.pool)
            .field("budget", &self.budget.stats())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryContext {
    /// Fresh context with its own budget and cancellation flag
    pub fn new(storage: StorageRef, pool: WorkerPool, config: ExecutionConfig) -> Self {
        Self {
            storage,
            pool,
            budget: Arc::new(MemoryBudget::new(config.memory_budget.max(1))),
            cancel: CancelHandle::default(),
            config: Arc::new(config),
        }
    }

    /// Storage the plan reads from and writes to
    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    /// Worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// In-flight memory budget
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Settings
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Partition count, at least one
    pub fn parallelism(&self) -> usize {
        self.config.parallelism.max(1)
    }

    /// Rows per batch, at least one
    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Request cancellation. Running pipelines stop at their next batch
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle that cancels this context from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
