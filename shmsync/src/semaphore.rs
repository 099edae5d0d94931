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

//! Counting semaphore for processes sharing memory.
//!
//! The count and the set of blocked waiters live next to a [`Spinlock`] and
//! are only touched while it is held. A waiter that finds the count at zero
//! registers itself and suspends until a wakeup signal arrives (see
//! [`crate::wakeup`]). [`Semaphore::inc`] wakes every registered waiter; the
//! woken waiters race for the lock and re-check the count, so spurious
//! wakeups are harmless.

use crate::spinlock::Spinlock;
use crate::sync::{yield_now, AtomicU64, Ordering};
use crate::wakeup::{self, BlockedWakeup};
use crate::{error::ShmSyncError, shm_trace};
use std::cell::UnsafeCell;
use tracing::warn;

/// Default capacity of the waiter set.
pub const DEFAULT_N_PROC: usize = 64;

/// Identity of a blocked waiter: the process and the thread inside it that
/// is suspended.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pid: libc::pid_t,
    tid: libc::pid_t,
}

impl Waiter {
    pub(crate) fn current() -> Self {
        Waiter {
            pid: wakeup::current_pid(),
            tid: wakeup::current_tid(),
        }
    }

    fn wake(self) {
        wakeup::wake(self.pid, self.tid);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    Added,
    AlreadyPresent,
    Full,
}

/// Fixed-capacity set of waiters.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct WaiterSet<const N: usize> {
    waiters: [Waiter; N],
    len: usize,
}

impl<const N: usize> WaiterSet<N> {
    const EMPTY: Waiter = Waiter { pid: 0, tid: 0 };

    pub(crate) fn new() -> Self {
        WaiterSet {
            waiters: [Self::EMPTY; N],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Waiter> + '_ {
        self.waiters[..self.len].iter().copied()
    }

    pub(crate) fn register(&mut self, waiter: Waiter) -> Registration {
        if self.iter().any(|w| w == waiter) {
            Registration::AlreadyPresent
        } else if self.len == N {
            Registration::Full
        } else {
            self.waiters[self.len] = waiter;
            self.len += 1;
            Registration::Added
        }
    }

    /// Empties the set, returning what it held.
    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::new())
    }
}

#[repr(C)]
struct State<const N: usize> {
    count: u32,
    waiters: WaiterSet<N>,
}

impl<const N: usize> State<N> {
    fn new(count: u32) -> Self {
        State {
            count,
            waiters: WaiterSet::new(),
        }
    }
}

enum Attempt {
    Acquired,
    Registered,
    Overflow,
}

/// Counting semaphore whose state is embedded by value, ready to be placed in
/// a shared mapping.
///
/// `N_PROC` bounds the number of waiters that can be registered at once. A
/// waiter that finds the set full cannot be targeted by a wakeup, so instead
/// of suspending it yields and polls the count until it either acquires a
/// unit or manages to register. Such events are counted in
/// [`Semaphore::waiter_overflows`].
#[repr(C)]
pub struct Semaphore<const N_PROC: usize = DEFAULT_N_PROC> {
    lock: Spinlock,
    state: UnsafeCell<State<N_PROC>>,
    overflows: AtomicU64,
}

// SAFETY: `state` is only accessed while `lock` is held.
unsafe impl<const N_PROC: usize> Sync for Semaphore<N_PROC> {}

impl<const N_PROC: usize> Semaphore<N_PROC> {
    /// Creates a semaphore holding `count` units.
    ///
    /// This only builds the value; the wakeup handler is installed by
    /// [`Semaphore::init`] or, failing that, by the first [`Semaphore::wait`]
    /// in each process.
    pub fn new(count: u32) -> Self {
        Semaphore {
            lock: Spinlock::new(),
            state: UnsafeCell::new(State::new(count)),
            overflows: AtomicU64::new(0),
        }
    }

    /// Resets the semaphore in place to `count` units with no waiters and
    /// installs the wakeup handler in the calling process.
    ///
    /// Must be called by exactly one process before any other process uses
    /// the semaphore; children forked afterwards inherit the handler.
    pub fn init(&self, count: u32) -> Result<(), ShmSyncError> {
        wakeup::install_handler()?;
        self.lock.init();
        self.with_state(|state| *state = State::new(count));
        self.overflows.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State<N_PROC>) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: the spinlock is held for as long as the borrow lives.
        f(unsafe { &mut *self.state.get() })
    }

    /// Takes a unit if one is available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.with_state(|state| {
            if state.count > 0 {
                state.count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Takes a unit, suspending the caller until one is available.
    ///
    /// Aborts the process if the signal mask cannot be changed, since the
    /// wakeup protocol cannot work without it.
    pub fn wait(&self) {
        wakeup::ensure_handler();
        let blocked = BlockedWakeup::new();
        let me = Waiter::current();
        let mut overflowed = false;

        loop {
            let attempt = self.with_state(|state| {
                if state.count > 0 {
                    state.count -= 1;
                    return Attempt::Acquired;
                }
                match state.waiters.register(me) {
                    Registration::Added | Registration::AlreadyPresent => Attempt::Registered,
                    Registration::Full => Attempt::Overflow,
                }
            });

            match attempt {
                Attempt::Acquired => return,
                Attempt::Registered => {
                    shm_trace!(pid = me.pid, tid = me.tid, "waiter suspending");
                    blocked.suspend();
                }
                Attempt::Overflow => {
                    if !overflowed {
                        overflowed = true;
                        let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            pid = me.pid,
                            capacity = N_PROC,
                            overflows = total,
                            "waiter set full, polling instead of suspending"
                        );
                    }
                    yield_now();
                }
            }
        }
    }

    /// Releases a unit and wakes every registered waiter.
    ///
    /// The count saturates at `u32::MAX`; a release past that is dropped
    /// with a warning.
    pub fn inc(&self) {
        let (saturated, waiters) = self.with_state(|state| match state.count.checked_add(1) {
            Some(count) => {
                state.count = count;
                (false, state.waiters.take())
            }
            None => (true, state.waiters.take()),
        });

        if saturated {
            warn!(count = u32::MAX, "semaphore count saturated, release dropped");
        }
        for waiter in waiters.iter() {
            waiter.wake();
        }
    }

    /// Waits for a unit and returns a permit that releases it when dropped.
    pub fn acquire(&self) -> Permit<'_, N_PROC> {
        self.wait();
        Permit { semaphore: self }
    }

    /// Snapshot of the available units.
    pub fn count(&self) -> u32 {
        self.with_state(|state| state.count)
    }

    /// Snapshot of the number of registered waiters.
    pub fn waiting(&self) -> usize {
        self.with_state(|state| state.waiters.len())
    }

    /// Number of `wait` calls that found the waiter set full.
    pub fn waiter_overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// A unit held from a [`Semaphore`], released with [`Semaphore::inc`] on drop.
pub struct Permit<'a, const N_PROC: usize = DEFAULT_N_PROC> {
    semaphore: &'a Semaphore<N_PROC>,
}

impl<const N_PROC: usize> Drop for Permit<'_, N_PROC> {
    fn drop(&mut self) {
        self.semaphore.inc();
    }
}
