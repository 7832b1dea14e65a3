//! Memory budget used for in-flight batch backpressure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Shared byte budget. Reservations that do not fit either fail
/// ([`MemoryBudget::allocate`]) or wait for a release
/// ([`MemoryBudget::reserve_blocking`]).
#[derive(Debug)]
pub struct MemoryBudget {
    /// The total memory budget in bytes
    total_budget: usize,

    /// The current memory usage in bytes
    current_usage: AtomicUsize,

    /// Highest usage seen
    peak_usage: AtomicUsize,

    released: Mutex<()>,
    freed: Condvar,
}

/// Point-in-time budget statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total budget in bytes
    pub total_budget: usize,
    /// Current usage in bytes
    pub current_usage: usize,
    /// Peak usage in bytes
    pub peak_usage: usize,
}

impl MemoryBudget {
    /// Create a new memory budget with the given total budget
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            current_usage: AtomicUsize::new(0),
            peak_usage: AtomicUsize::new(0),
            released: Mutex::new(()),
            freed: Condvar::new(),
        }
    }

    /// Try to allocate memory, returns false if exceeds budget
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.current_usage.load(Ordering::SeqCst);

        loop {
            if current + bytes > self.total_budget {
                return false;
            }

            match self.current_usage.compare_exchange(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.peak_usage.fetch_max(current + bytes, Ordering::SeqCst);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocate memory, returning an error if it exceeds budget
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        if self.try_allocate(bytes) {
            Ok(())
        } else {
            Err(Error::MemoryBudgetExceeded {
                requested: bytes,
                available: self.available(),
            })
        }
    }

    /// Release previously allocated memory and wake waiters
    pub fn release(&self, bytes: usize) {
        let prev = self.current_usage.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(
            prev >= bytes,
            "Attempted to release more memory than allocated: prev={}, release={}",
            prev,
            bytes
        );
        let _guard = self.released.lock();
        self.freed.notify_all();
    }

    /// Reserve `bytes`, waiting while the budget is exhausted.
    ///
    /// A request larger than the whole budget is clamped to the budget so a
    /// single oversized batch can still make progress once everything else
    /// has been released. `should_abort` is polled between waits; when it
    /// returns true the reservation is abandoned with [`Error::Cancelled`].
    pub fn reserve_blocking(
        self: &Arc<Self>,
        bytes: usize,
        should_abort: impl Fn() -> bool,
    ) -> Result<Reservation> {
        let bytes = bytes.min(self.total_budget);
        loop {
            if self.try_allocate(bytes) {
                return Ok(Reservation {
                    budget: Arc::clone(self),
                    bytes,
                });
            }
            if should_abort() {
                return Err(Error::Cancelled);
            }
            let mut guard = self.released.lock();
            self.freed
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    /// Get current memory usage
    pub fn usage(&self) -> usize {
        self.current_usage.load(Ordering::SeqCst)
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.total_budget.saturating_sub(self.usage())
    }

    /// Get percent of budget used
    pub fn percent_used(&self) -> f64 {
        let usage = self.usage() as f64;
        let budget = self.total_budget as f64;
        (usage / budget) * 100.0
    }

    /// Get memory statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_budget: self.total_budget,
            current_usage: self.usage(),
            peak_usage: self.peak_usage.load(Ordering::SeqCst),
        }
    }
}

/// RAII reservation against a [`MemoryBudget`]
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl Reservation {
    /// Reserved bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let budget = MemoryBudget::new(100);
        assert!(budget.try_allocate(60));
        assert!(!budget.try_allocate(50));
        assert!(matches!(
            budget.allocate(50),
            Err(Error::MemoryBudgetExceeded { requested: 50, available: 40 })
        ));
        budget.release(60);
        assert!(budget.try_allocate(100));
        assert_eq!(budget.stats().peak_usage, 100);
    }

    #[test]
    fn test_reserve_blocking_waits_for_release() {
        let budget = Arc::new(MemoryBudget::new(100));
        let first = budget.reserve_blocking(80, || false).unwrap();

        let waiter = {
            let budget = Arc::clone(&budget);
            thread::spawn(move || budget.reserve_blocking(50, || false).map(|r| r.bytes()))
        };

        thread::sleep(Duration::from_millis(30));
        drop(first);
        assert_eq!(waiter.join().unwrap().unwrap(), 50);
        assert_eq!(budget.usage(), 0);
    }

    #[test]
    fn test_reserve_blocking_abort() {
        let budget = Arc::new(MemoryBudget::new(10));
        let _held = budget.reserve_blocking(10, || false).unwrap();
        let abort = AtomicBool::new(true);
        let result = budget.reserve_blocking(5, || abort.load(Ordering::SeqCst));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_oversized_request_is_clamped() {
        let budget = Arc::new(MemoryBudget::new(10));
        let r = budget.reserve_blocking(1000, || false).unwrap();
        assert_eq!(r.bytes(), 10);
    }
}
