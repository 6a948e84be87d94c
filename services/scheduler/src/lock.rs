//! The coordinator's two locks.
//!
//! The state lock serializes lifecycle transitions and the stop sequence.
//! The offers lock serializes the offer pipeline and rescinds. Callers never
//! hold both at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Paired state and offers locks with acquisition counters.
#[derive(Debug, Default)]
pub struct SchedulerLock {
    state: Mutex<()>,
    offers: Mutex<()>,
    state_acquisitions: AtomicU64,
    offers_acquisitions: AtomicU64,
}

impl SchedulerLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the state lock on behalf of `name`.
    pub async fn lock_state(&self, name: &'static str) -> StateGuard<'_> {
        let start = Instant::now();
        let guard = self.state.lock().await;
        self.state_acquisitions.fetch_add(1, Ordering::Relaxed);
        trace!(
            lock = "state",
            name,
            waited_ms = start.elapsed().as_millis() as u64,
            "Acquired lock"
        );
        StateGuard(TimedGuard::new("state", name, guard))
    }

    /// Acquires the offers lock on behalf of `name`.
    pub async fn lock_offers(&self, name: &'static str) -> OffersGuard<'_> {
        let start = Instant::now();
        let guard = self.offers.lock().await;
        self.offers_acquisitions.fetch_add(1, Ordering::Relaxed);
        trace!(
            lock = "offers",
            name,
            waited_ms = start.elapsed().as_millis() as u64,
            "Acquired lock"
        );
        OffersGuard(TimedGuard::new("offers", name, guard))
    }

    /// Number of times the state lock has been taken.
    pub fn state_acquisitions(&self) -> u64 {
        self.state_acquisitions.load(Ordering::Relaxed)
    }

    /// Number of times the offers lock has been taken.
    pub fn offers_acquisitions(&self) -> u64 {
        self.offers_acquisitions.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct TimedGuard<'a> {
    lock: &'static str,
    name: &'static str,
    acquired: Instant,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> TimedGuard<'a> {
    fn new(lock: &'static str, name: &'static str, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            lock,
            name,
            acquired: Instant::now(),
            _guard: guard,
        }
    }
}

impl Drop for TimedGuard<'_> {
    fn drop(&mut self) {
        let held_ms = self.acquired.elapsed().as_millis() as u64;
        if held_ms >= 1_000 {
            debug!(lock = self.lock, name = self.name, held_ms, "Released long-held lock");
        } else {
            trace!(lock = self.lock, name = self.name, held_ms, "Released lock");
        }
    }
}

/// Proof that the state lock is held.
#[derive(Debug)]
pub struct StateGuard<'a>(TimedGuard<'a>);

/// Proof that the offers lock is held.
#[derive(Debug)]
pub struct OffersGuard<'a>(TimedGuard<'a>);

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_counts_acquisitions_per_lock() {
        let lock = SchedulerLock::new();
        drop(lock.lock_state("a").await);
        drop(lock.lock_offers("b").await);
        drop(lock.lock_offers("c").await);
        assert_eq!(lock.state_acquisitions(), 1);
        assert_eq!(lock.offers_acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_locks_are_independent() {
        let lock = SchedulerLock::new();
        let _offers = lock.lock_offers("held").await;
        let state = tokio::time::timeout(Duration::from_millis(100), lock.lock_state("other")).await;
        assert!(state.is_ok());
    }

    #[tokio::test]
    async fn test_state_lock_serializes() {
        let lock = Arc::new(SchedulerLock::new());
        let guard = lock.lock_state("first").await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.lock_state("second").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(lock.state_acquisitions(), 2);
    }
}
