//! Bounded permits for concurrent training jobs.
//!
//! # Motivation
//!
//! Growth and evolution train many candidate networks at once on rayon's
//! pool. Each candidate holds its own copy of the network, so running all of
//! them at the same time multiplies memory use. A [`TrainingPool`] caps how
//! many candidates train simultaneously; by default 80% of the available
//! cores.
//!
//! # Thread Safety
//!
//! Permits are counted under a `parking_lot::Mutex` and waiters sleep on a
//! `Condvar`. A [`Permit`] returns itself to the pool when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::{ParagonError, ParagonResult};
use crate::training::CancelToken;

/// How often a cancellable waiter re-checks its token.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Counting semaphore sized for candidate training.
pub struct TrainingPool {
    /// Permits currently available
    available: Mutex<usize>,
    capacity: usize,
    released: Condvar,
    /// Acquisitions satisfied without waiting
    immediate: AtomicUsize,
    /// Acquisitions that had to wait
    waited: AtomicUsize,
}

/// Statistics from the pool for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub immediate: usize,
    pub waited: usize,
    /// Fraction of acquisitions that waited, `[0.0, 1.0]`
    pub wait_rate: f64,
}

/// A held slot; released on drop.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    pool: &'a TrainingPool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.pool.available.lock();
        *available += 1;
        self.pool.released.notify_one();
    }
}

#[allow(clippy::must_use_candidate)]
impl TrainingPool {
    /// Pool with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            available: Mutex::new(capacity),
            capacity,
            released: Condvar::new(),
            immediate: AtomicUsize::new(0),
            waited: AtomicUsize::new(0),
        }
    }

    /// 80% of available parallelism, at least one.
    pub fn default_size() -> usize {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        (cores * 4 / 5).max(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Block until a permit is free.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        if *available == 0 {
            self.waited.fetch_add(1, Ordering::Relaxed);
            while *available == 0 {
                self.released.wait(&mut available);
            }
        } else {
            self.immediate.fetch_add(1, Ordering::Relaxed);
        }
        *available -= 1;
        Permit { pool: self }
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        self.immediate.fetch_add(1, Ordering::Relaxed);
        Some(Permit { pool: self })
    }

    /// Block until a permit is free or `cancel` fires.
    ///
    /// # Errors
    /// `Cancelled` if the token is set before a permit is obtained.
    pub fn acquire_cancellable(&self, cancel: Option<&CancelToken>) -> ParagonResult<Permit<'_>> {
        let Some(token) = cancel else {
            return Ok(self.acquire());
        };
        if token.is_cancelled() {
            return Err(ParagonError::Cancelled);
        }
        let mut available = self.available.lock();
        if *available == 0 {
            self.waited.fetch_add(1, Ordering::Relaxed);
            while *available == 0 {
                if token.is_cancelled() {
                    return Err(ParagonError::Cancelled);
                }
                self.released.wait_for(&mut available, CANCEL_POLL);
            }
        } else {
            self.immediate.fetch_add(1, Ordering::Relaxed);
        }
        *available -= 1;
        Ok(Permit { pool: self })
    }

    pub fn stats(&self) -> PoolStats {
        let immediate = self.immediate.load(Ordering::Relaxed);
        let waited = self.waited.load(Ordering::Relaxed);
        let total = immediate + waited;
        PoolStats {
            capacity: self.capacity,
            in_use: self.capacity - self.available(),
            immediate,
            waited,
            wait_rate: if total > 0 {
                waited as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for TrainingPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permits_are_bounded() {
        let pool = TrainingPool::new(2);
        let a = pool.acquire();
        let _b = pool.acquire();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.stats().in_use, 2);
        drop(a);
        assert!(pool.try_acquire().is_some());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_capacity_becomes_one() {
        assert_eq!(TrainingPool::new(0).capacity(), 1);
        assert!(TrainingPool::default_size() >= 1);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = Arc::new(TrainingPool::new(1));
        let held = pool.acquire();
        let worker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let _p = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        worker.join().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_cancellable_acquire() {
        let pool = TrainingPool::new(1);
        let _held = pool.acquire();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            pool.acquire_cancellable(Some(&token)),
            Err(ParagonError::Cancelled)
        ));
    }

    #[test]
    fn test_concurrent_use_never_exceeds_capacity() {
        let pool = Arc::new(TrainingPool::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let (pool, active, peak) = (Arc::clone(&pool), Arc::clone(&active), Arc::clone(&peak));
                thread::spawn(move || {
                    let _p = pool.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }
}
