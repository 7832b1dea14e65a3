//! Shared worker pool

use std::fmt;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tabula_core::{Error, Result};

/// Fixed-size thread pool shared by every materialization of an engine.
/// Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|idx| format!("tabula-worker-{idx}"))
            .build()
            .map_err(|e| Error::InvalidOperation(format!("failed to build worker pool: {}", e)))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `task` on a worker without waiting for it
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(task);
    }

    /// Run `op` inside the pool and wait for its result
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_spawned_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.num_threads(), 2);

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam::channel::unbounded();
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            let tx = tx.clone();
            pool.spawn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 8);
        assert_eq!(hits.load(Ordering::SeqCst), 8);

        let name = pool.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap().starts_with("tabula-worker-"));
    }

    #[test]
    fn test_zero_threads_means_one() {
        assert_eq!(WorkerPool::new(0).unwrap().num_threads(), 1);
    }
}
