use crate::spinlock::Spinlock;
use crate::sync::{AtomicU64, Ordering};
use loom::{model::Builder, sync::Arc, thread};

struct Counter {
    lock: Spinlock,
    value: AtomicU64,
}

fn builder() -> Builder {
    let mut builder = Builder::new();
    if builder.preemption_bound.is_none() {
        builder.preemption_bound = Some(3);
    }
    builder
}

#[test]
fn test_spinlock_no_lost_updates() {
    builder().check(|| {
        let counter = Arc::new(Counter {
            lock: Spinlock::new(),
            value: AtomicU64::new(0),
        });
        let threads = 2;
        let iterations = 2;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..iterations {
                        counter.lock.acquire();
                        let value = counter.value.load(Ordering::Relaxed);
                        counter.value.store(value + 1, Ordering::Relaxed);
                        counter.lock.release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value.load(Ordering::Relaxed), threads * iterations);
        assert!(!counter.lock.is_locked());
    });
}

#[test]
fn test_spinlock_publishes_writes() {
    builder().check(|| {
        let counter = Arc::new(Counter {
            lock: Spinlock::new(),
            value: AtomicU64::new(0),
        });

        let writer = {
            let counter = counter.clone();
            thread::spawn(move || {
                let _guard = counter.lock.lock();
                counter.value.store(7, Ordering::Relaxed);
            })
        };

        if counter.lock.try_acquire() {
            let seen = counter.value.load(Ordering::Relaxed);
            assert!(seen == 0 || seen == 7);
            counter.lock.release();
        }

        writer.join().unwrap();

        let _guard = counter.lock.lock();
        assert_eq!(counter.value.load(Ordering::Relaxed), 7);
    });
}
