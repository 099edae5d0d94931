//! Bounded FIFO of machine words guarded by three semaphores.
//!
//! `empty` counts free slots, `full` counts occupied slots and `mutex`
//! serializes cursor updates, so any number of producers and consumers may
//! use the same queue. Each producer's values come out in the order it pushed
//! them; interleaving between producers follows arrival order at `mutex`.

use crate::error::ShmSyncError;
use crate::semaphore::Semaphore;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;

/// Default number of slots.
pub const DEFAULT_CAPACITY: usize = 4096;

#[repr(C)]
struct Ring<const C: usize> {
    slots: [u64; C],
    read: usize,
    write: usize,
}

impl<const C: usize> Ring<C> {
    fn new() -> Self {
        Ring {
            slots: [0; C],
            read: 0,
            write: 0,
        }
    }

    fn put(&mut self, value: u64) {
        self.slots[self.write] = value;
        self.write = (self.write + 1) % C;
    }

    fn take(&mut self) -> u64 {
        let value = self.slots[self.read];
        self.read = (self.read + 1) % C;
        value
    }
}

#[repr(C)]
pub struct Fifo<const C: usize = DEFAULT_CAPACITY> {
    mutex: CachePadded<Semaphore>,
    empty: CachePadded<Semaphore>,
    full: CachePadded<Semaphore>,
    ring: UnsafeCell<Ring<C>>,
}

// SAFETY: `ring` is only accessed while a permit from `mutex` is held.
unsafe impl<const C: usize> Sync for Fifo<C> {}

impl<const C: usize> Fifo<C> {
    const CAPACITY: u32 = {
        assert!(C > 0, "fifo capacity must be non-zero");
        assert!(C <= u32::MAX as usize, "fifo capacity must fit a semaphore count");
        C as u32
    };

    /// Creates an empty queue.
    pub fn new() -> Self {
        Fifo {
            mutex: CachePadded::new(Semaphore::new(1)),
            empty: CachePadded::new(Semaphore::new(Self::CAPACITY)),
            full: CachePadded::new(Semaphore::new(0)),
            ring: UnsafeCell::new(Ring::new()),
        }
    }

    /// Resets the queue in place to empty and installs the wakeup handler.
    ///
    /// Must be called by exactly one process before any other process uses
    /// the queue.
    pub fn init(&self) -> Result<(), ShmSyncError> {
        self.mutex.init(1)?;
        self.empty.init(Self::CAPACITY)?;
        self.full.init(0)?;
        self.with_ring(|ring| {
            ring.read = 0;
            ring.write = 0;
        });
        Ok(())
    }

    fn with_ring<R>(&self, f: impl FnOnce(&mut Ring<C>) -> R) -> R {
        let _permit = self.mutex.acquire();
        // SAFETY: the mutex permit is held for as long as the borrow lives.
        f(unsafe { &mut *self.ring.get() })
    }

    /// Appends `value`, blocking while the queue is full.
    pub fn push(&self, value: u64) {
        self.empty.wait();
        self.with_ring(|ring| ring.put(value));
        self.full.inc();
    }

    /// Removes the oldest value, blocking while the queue is empty.
    pub fn pop(&self) -> u64 {
        self.full.wait();
        let value = self.with_ring(Ring::take);
        self.empty.inc();
        value
    }

    /// Appends `value` if a slot is free, handing it back otherwise.
    pub fn try_push(&self, value: u64) -> Result<(), u64> {
        if !self.empty.try_acquire() {
            return Err(value);
        }
        self.with_ring(|ring| ring.put(value));
        self.full.inc();
        Ok(())
    }

    /// Removes the oldest value if there is one.
    pub fn try_pop(&self) -> Option<u64> {
        if !self.full.try_acquire() {
            return None;
        }
        let value = self.with_ring(Ring::take);
        self.empty.inc();
        Some(value)
    }

    /// Snapshot of the number of values that can be popped without blocking.
    pub fn len(&self) -> usize {
        self.full.count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        C
    }
}

impl<const C: usize> Default for Fifo<C> {
    fn default() -> Self {
        Self::new()
    }
}
