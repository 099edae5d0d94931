//! Test-and-set spinlock.
//!
//! The lock is a single word that can be embedded by value in memory shared
//! between processes. Acquisition swaps `true` into the word and retries after
//! `sched_yield` until the swap observes `false`, so a contended acquirer gives
//! its quantum to the holder instead of burning it.
//!
//! There is no owner tracking: releasing a lock held by someone else, or
//! acquiring it twice from the same caller, is a contract violation that is
//! neither detected nor reported.

use crate::shm_trace;
use crate::sync::{yield_now, AtomicBool, Ordering};

#[repr(C)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    /// Creates an unlocked spinlock.
    pub fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    /// Resets the word to unlocked.
    ///
    /// Must run before any process contends on the lock.
    pub fn init(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Spins until the caller flips the word from unlocked to locked.
    #[inline]
    pub fn acquire(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            shm_trace!("spinlock contended, yielding");
            yield_now();
        }
    }

    /// Single test-and-set attempt. Returns `true` if the lock was taken.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Acquires the lock and returns a guard that releases it when dropped.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_> {
        self.acquire();
        SpinlockGuard { lock: self }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[fixture]
    fn lock() -> Spinlock {
        Spinlock::new()
    }

    #[rstest]
    fn test_new_lock_is_unlocked(lock: Spinlock) {
        assert!(!lock.is_locked());
    }

    #[rstest]
    fn test_acquire_release(lock: Spinlock) {
        lock.acquire();
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());

        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
        lock.release();
    }

    #[rstest]
    fn test_guard_releases_on_drop(lock: Spinlock) {
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[rstest]
    fn test_init_unlocks(lock: Spinlock) {
        lock.acquire();
        lock.init();
        assert!(!lock.is_locked());
    }

    #[rstest]
    #[case(2, 10_000)]
    #[case(8, 5_000)]
    fn test_threads_do_not_lose_updates(#[case] threads: u64, #[case] iterations: u64) {
        struct Shared {
            lock: Spinlock,
            counter: AtomicU64,
        }

        let shared = Arc::new(Shared {
            lock: Spinlock::new(),
            counter: AtomicU64::new(0),
        });

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..iterations {
                        let _guard = shared.lock.lock();
                        // separate load and store; only the lock keeps them paired
                        let value = shared.counter.load(Ordering::Relaxed);
                        shared.counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        assert_eq!(shared.counter.load(Ordering::Relaxed), threads * iterations);
    }
}
