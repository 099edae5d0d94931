//! Typed shared-memory regions.
//!
//! [`Shared<T>`] places a value in a `MAP_SHARED` mapping. Every process
//! forked after the region is created sees the same `T`, which is how the
//! primitives in this crate are meant to be hosted:
//!
//! ```no_run
//! use shmsync::{Fifo, Shared};
//!
//! let fifo = Shared::new(Fifo::<1024>::new())?;
//! fifo.init()?;
//! // fork producers and consumers; each calls fifo.push(..) / fifo.pop()
//! # Ok::<(), shmsync::ShmSyncError>(())
//! ```
//!
//! Dropping a `Shared<T>` only unmaps the calling process's view. `T` is never
//! dropped, since other processes may still be using it.

use crate::{error::ShmSyncError, memory::Memory};
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

pub struct Shared<T> {
    memory: Memory,
    _marker: PhantomData<T>,
}

// SAFETY: every process and thread with a view of the region only gets `&T`.
unsafe impl<T: Sync> Send for Shared<T> {}
unsafe impl<T: Sync> Sync for Shared<T> {}

impl<T: Sync> Shared<T> {
    /// Places `value` in a new memfd-backed region.
    pub fn new(value: T) -> Result<Self, ShmSyncError> {
        let memory = Memory::new(std::mem::size_of::<T>()).map_err(into_error)?;
        Ok(Self::place(memory, value))
    }

    /// Places `value` in a new anonymous region, shared only with processes
    /// forked afterwards.
    pub fn anonymous(value: T) -> Result<Self, ShmSyncError> {
        let memory = Memory::anonymous(std::mem::size_of::<T>()).map_err(into_error)?;
        Ok(Self::place(memory, value))
    }

    /// Maps a region created by [`Shared::new`] in another process.
    ///
    /// # Safety
    ///
    /// `fd` must come from [`Shared::fd`] or [`Shared::clone_fd`] of a
    /// `Shared<T>` with the same `T`, built by the same binary so the layout
    /// matches. The value must already be initialized.
    pub unsafe fn from_fd(fd: OwnedFd) -> Result<Self, ShmSyncError> {
        let memory = Memory::from_fd(fd, std::mem::size_of::<T>()).map_err(into_error)?;
        Ok(Shared {
            memory,
            _marker: PhantomData,
        })
    }

    fn place(memory: Memory, value: T) -> Self {
        assert!(
            std::mem::align_of::<T>() <= crate::memory::page_size(),
            "shared value alignment exceeds the page size"
        );
        // SAFETY: the mapping is page aligned, large enough for `T` and not
        // yet visible to any other process.
        unsafe { memory.as_ptr().cast::<T>().as_ptr().write(value) };
        Shared {
            memory,
            _marker: PhantomData,
        }
    }

    /// Descriptor of the backing file, for handing the region to another
    /// process. `None` for anonymous regions.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.memory.fd().map(|fd| fd.as_fd())
    }

    pub fn clone_fd(&self) -> Result<Option<OwnedFd>, ShmSyncError> {
        self.memory.clone_fd().map_err(into_error)
    }

    /// Size of the mapping in bytes, a whole number of pages.
    pub fn region_size(&self) -> usize {
        self.memory.size()
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping holds an initialized `T` for as long as it exists.
        unsafe { self.memory.as_ptr().cast::<T>().as_ref() }
    }
}

fn into_error(report: eyre::Report) -> ShmSyncError {
    match report.downcast::<ShmSyncError>() {
        Ok(err) => err,
        Err(report) => ShmSyncError::MmapFailed(format!("{report:#}")),
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{Fifo, Semaphore};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_value_is_placed() -> Result<(), ShmSyncError> {
        let counter = Shared::anonymous(AtomicU64::new(42))?;
        assert_eq!(counter.load(Ordering::Relaxed), 42);
        assert_eq!(counter.region_size() % crate::memory::page_size(), 0);
        assert!(counter.fd().is_none());
        Ok(())
    }

    #[test]
    fn test_from_fd_shares_state() -> Result<(), ShmSyncError> {
        let sem: Shared<Semaphore> = Shared::new(Semaphore::new(2))?;
        let fd = sem.clone_fd()?.expect("memfd region has a descriptor");
        let view: Shared<Semaphore> = unsafe { Shared::from_fd(fd)? };

        assert!(view.try_acquire());
        assert_eq!(sem.count(), 1);
        sem.inc();
        assert_eq!(view.count(), 2);
        Ok(())
    }

    #[test]
    fn test_from_fd_rejects_smaller_region() -> Result<(), ShmSyncError> {
        let small = Shared::new(0u8)?;
        let fd = small.clone_fd()?.expect("memfd region has a descriptor");

        let result = unsafe { Shared::<Fifo<{ 64 * 1024 }>>::from_fd(fd) };
        assert!(matches!(result, Err(ShmSyncError::SizeMismatch { .. })));
        Ok(())
    }
}
