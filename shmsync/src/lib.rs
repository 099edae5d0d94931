//! # shmsync - Synchronization for Processes Sharing Memory
//!
//! A spinlock, a counting semaphore and a bounded FIFO whose state lives
//! entirely inside a shared memory region, so unrelated processes (typically
//! children forked after the region was mapped) can coordinate through it.
//!
//! The semaphore does not use kernel semaphores or futexes. A blocked waiter
//! registers its identity in the semaphore and suspends with `sigsuspend`; a
//! release sends `SIGUSR1` to every registered waiter. Signal masking makes
//! the check-then-suspend step atomic with respect to wakeups.
//!
//! ## Placing State in Shared Memory
//!
//! Every primitive is `#[repr(C)]` and owns no heap memory. Put it in a
//! [`Shared`] region before forking:
//!
//! ```no_run
//! use shmsync::{Semaphore, Shared};
//!
//! let sem = Shared::anonymous(Semaphore::<64>::new(0))?;
//! sem.init(0)?; // installs the wakeup handler, inherited by children
//! # Ok::<(), shmsync::ShmSyncError>(())
//! ```
//!
//! `init` must run exactly once, in one process, before any other process
//! touches the value.
//!
//! ## Spinlock
//!
//! ```rust
//! use shmsync::Spinlock;
//!
//! let lock = Spinlock::new();
//! lock.acquire();
//! // critical section: field reads and writes only
//! lock.release();
//!
//! let guard = lock.lock(); // released when dropped
//! # drop(guard);
//! ```
//!
//! ## Semaphore
//!
//! ```rust
//! use shmsync::Semaphore;
//!
//! let sem: Semaphore = Semaphore::new(1);
//! assert!(sem.try_acquire());   // never blocks
//! assert!(!sem.try_acquire());
//! sem.inc();                    // release, wakes every waiter
//! sem.wait();                   // blocks until a unit is available
//! sem.inc();
//!
//! let permit = sem.acquire();   // wait + inc on drop
//! # drop(permit);
//! ```
//!
//! ## Bounded FIFO
//!
//! ```rust
//! use shmsync::Fifo;
//!
//! let fifo = Fifo::<16>::new();
//! fifo.init()?;
//! fifo.push(7);                 // blocks while full
//! assert_eq!(fifo.pop(), 7);    // blocks while empty
//! assert_eq!(fifo.try_pop(), None);
//! # Ok::<(), shmsync::ShmSyncError>(())
//! ```
//!
//! ## Handing a Region to Another Process
//!
//! Regions created with [`Shared::new`] are backed by a memfd. The descriptor
//! can be passed over a Unix socket and mapped with [`Shared::from_fd`]. A
//! process that reaches the region that way (rather than through `fork`)
//! gets its wakeup handler installed by its first `wait`.

pub use error::ShmSyncError;
pub use fifo::{Fifo, DEFAULT_CAPACITY};
pub use semaphore::{Permit, Semaphore, DEFAULT_N_PROC};
pub use shared::Shared;
pub use spinlock::{Spinlock, SpinlockGuard};
pub use wakeup::{install_handler, WAKEUP_SIGNAL};

pub mod error;
pub mod fifo;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod memory;
pub mod semaphore;
pub mod shared;
pub mod spinlock;
pub(crate) mod sync;
mod trace_macro;
pub mod wakeup;
