// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Multi-process scenarios exercising the primitives.
//!
//! Each scenario maps a region, initializes it in the calling process, forks
//! workers and compares what they did against what they should have done.

use crate::worker::{join_all, Worker};
use eyre::{ensure, Result};
use shmsync::{Fifo, Semaphore, Shared, Spinlock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub name: &'static str,
    pub expected: u64,
    pub observed: u64,
    pub elapsed: Duration,
    /// A mismatch fails the run. Reports that only demonstrate an effect,
    /// like lost updates without a lock, are not strict.
    pub strict: bool,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.expected == self.observed
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {} ({}) in {:?}",
            self.name,
            self.expected,
            self.observed,
            if self.passed() { "passed" } else { "FAILED" },
            self.elapsed
        )
    }
}

#[repr(C)]
struct SpinRegion {
    lock: Spinlock,
    counter: AtomicU64,
}

/// Increments a shared counter from `processes` workers, `iterations` times
/// each. The increment is a separate load and store, so only the spinlock
/// keeps updates from being lost; with `locked == false` the counter usually
/// ends up short.
pub fn spin_counter(processes: u64, iterations: u64, locked: bool) -> Result<Report> {
    let region = Shared::anonymous(SpinRegion {
        lock: Spinlock::new(),
        counter: AtomicU64::new(0),
    })?;
    region.lock.init();

    let start = Instant::now();
    let workers = (0..processes)
        .map(|_| {
            Worker::spawn(|| {
                for _ in 0..iterations {
                    if locked {
                        region.lock.acquire();
                    }
                    let value = region.counter.load(Ordering::Relaxed);
                    region.counter.store(value + 1, Ordering::Relaxed);
                    if locked {
                        region.lock.release();
                    }
                }
                0
            })
        })
        .collect::<Result<Vec<_>>>()?;
    join_all(workers)?;

    Ok(Report {
        name: if locked { "spinlock" } else { "no lock" },
        expected: processes * iterations,
        observed: region.counter.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
        strict: locked,
    })
}

#[repr(C)]
struct MutexRegion {
    mutex: Semaphore,
    counter: AtomicU64,
}

/// Same as [`spin_counter`], with a 1-count semaphore as the mutex.
pub fn semaphore_mutex(processes: u64, iterations: u64) -> Result<Report> {
    let region = Shared::anonymous(MutexRegion {
        mutex: Semaphore::new(1),
        counter: AtomicU64::new(0),
    })?;
    region.mutex.init(1)?;

    let start = Instant::now();
    let workers = (0..processes)
        .map(|_| {
            Worker::spawn(|| {
                for _ in 0..iterations {
                    region.mutex.wait();
                    let value = region.counter.load(Ordering::Relaxed);
                    region.counter.store(value + 1, Ordering::Relaxed);
                    region.mutex.inc();
                }
                0
            })
        })
        .collect::<Result<Vec<_>>>()?;
    join_all(workers)?;

    Ok(Report {
        name: "semaphore mutex",
        expected: processes * iterations,
        observed: region.counter.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
        strict: true,
    })
}

/// Value the blocked worker stores once it resumes after the release.
pub const WOKE_AFTER_RELEASE: u64 = 42;
/// Value the blocked worker stores if it resumed before the release.
pub const WOKE_EARLY: u64 = 1;

#[repr(C)]
struct BlockingRegion {
    sem: Semaphore,
    released: AtomicBool,
    counter: AtomicU64,
}

/// A worker waits on a 0-count semaphore while the caller sleeps for
/// `delay` and then releases it. The worker records whether the release had
/// already happened when it resumed.
pub fn blocking_wakeup(delay: Duration) -> Result<Report> {
    let region = Shared::anonymous(BlockingRegion {
        sem: Semaphore::new(0),
        released: AtomicBool::new(false),
        counter: AtomicU64::new(0),
    })?;
    region.sem.init(0)?;

    let start = Instant::now();
    let waiter = Worker::spawn(|| {
        region.sem.wait();
        let value = if region.released.load(Ordering::Acquire) {
            WOKE_AFTER_RELEASE
        } else {
            WOKE_EARLY
        };
        region.counter.store(value, Ordering::Release);
        0
    })?;
    info!(pid = waiter.pid().as_raw(), "worker waiting on semaphore");

    thread::sleep(delay);
    ensure!(
        region.counter.load(Ordering::Acquire) == 0,
        "worker resumed before the semaphore was released"
    );
    debug!(waiting = region.sem.waiting(), "releasing worker");
    region.released.store(true, Ordering::Release);
    region.sem.inc();
    join_all([waiter])?;

    Ok(Report {
        name: "blocking wakeup",
        expected: WOKE_AFTER_RELEASE,
        observed: region.counter.load(Ordering::Acquire),
        elapsed: start.elapsed(),
        strict: true,
    })
}

#[repr(C)]
struct OrderRegion {
    fifo: Fifo,
    in_order: AtomicU64,
}

/// One producer pushes `0..items`, one consumer pops and counts how many
/// came out in order before the first mismatch.
pub fn fifo_order(items: u64) -> Result<Report> {
    let region = Shared::anonymous(OrderRegion {
        fifo: Fifo::new(),
        in_order: AtomicU64::new(0),
    })?;
    region.fifo.init()?;

    let start = Instant::now();
    let consumer = Worker::spawn(|| {
        let mut in_order = 0;
        let mut mismatched = false;
        for expected in 0..items {
            let value = region.fifo.pop();
            if value == expected && !mismatched {
                in_order += 1;
            } else {
                mismatched = true;
            }
        }
        region.in_order.store(in_order, Ordering::Release);
        i32::from(mismatched)
    })?;
    let producer = Worker::spawn(|| {
        for value in 0..items {
            region.fifo.push(value);
        }
        0
    })?;

    let producer_code = producer.join()?;
    let consumer_code = consumer.join()?;
    ensure!(producer_code == 0, "producer exited with {}", producer_code);
    debug!(consumer_code, "consumer finished");

    Ok(Report {
        name: "fifo order",
        expected: items,
        observed: region.in_order.load(Ordering::Acquire),
        elapsed: start.elapsed(),
        strict: true,
    })
}

/// Packs a producer id and sequence number into one queue word.
pub fn pack(producer: u32, seq: u32) -> u64 {
    (u64::from(producer) << 32) | u64::from(seq)
}

pub fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Per-producer sequence checker used by the consumer in [`acid`].
#[derive(Debug)]
pub struct SequenceCheck {
    next: Vec<u32>,
    errors: u64,
}

impl SequenceCheck {
    pub fn new(producers: usize) -> Self {
        SequenceCheck {
            next: vec![0; producers],
            errors: 0,
        }
    }

    /// Records `word`; returns `false` for an unknown producer or a gap.
    pub fn observe(&mut self, word: u64) -> bool {
        let (producer, seq) = unpack(word);
        match self.next.get_mut(producer as usize) {
            Some(next) if *next == seq => {
                *next += 1;
                true
            }
            Some(next) => {
                *next = seq.wrapping_add(1);
                self.errors += 1;
                false
            }
            None => {
                self.errors += 1;
                false
            }
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Number of producers whose whole run of `items` has been seen.
    pub fn completed(&self, items: u32) -> usize {
        self.next.iter().filter(|&&next| next == items).count()
    }
}

#[repr(C)]
struct AcidRegion {
    fifo: Fifo,
    received: AtomicU64,
    errors: AtomicU64,
}

/// `producers` workers each push their own sequence `0..items`; a single
/// consumer checks every producer's run is gapless and in order. The report
/// counts items received without a sequence error.
pub fn acid(producers: u32, items: u32) -> Result<Report> {
    let total = u64::from(producers) * u64::from(items);
    let region = Shared::anonymous(AcidRegion {
        fifo: Fifo::new(),
        received: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    })?;
    region.fifo.init()?;
    info!(producers, items, "starting acid test");

    let start = Instant::now();
    let consumer = Worker::spawn(|| {
        let mut check = SequenceCheck::new(producers as usize);
        for _ in 0..total {
            if check.observe(region.fifo.pop()) {
                region.received.fetch_add(1, Ordering::Relaxed);
            }
        }
        region.errors.store(check.errors(), Ordering::Release);
        i32::from(check.completed(items) != producers as usize)
    })?;

    let workers = (0..producers)
        .map(|producer| {
            Worker::spawn(|| {
                for seq in 0..items {
                    region.fifo.push(pack(producer, seq));
                }
                0
            })
        })
        .collect::<Result<Vec<_>>>()?;
    join_all(workers)?;
    info!("all producers completed");

    let consumer_code = consumer.join()?;
    let errors = region.errors.load(Ordering::Acquire);
    debug!(consumer_code, errors, "consumer finished");

    Ok(Report {
        name: "acid",
        expected: total,
        observed: region.received.load(Ordering::Acquire),
        elapsed: start.elapsed(),
        strict: true,
    })
}
