use crate::error::ShmSyncError;
use core::ptr::NonNull;
use eyre::{ensure, Result, WrapErr};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::os::fd::{AsFd, OwnedFd};
use tracing::debug;

/// A read/write `MAP_SHARED` mapping, inherited across `fork`.
pub(crate) struct Memory {
    ptr: NonNull<u8>,
    size: usize,
    fd: Option<OwnedFd>,
}

impl Memory {
    /// Maps `size` bytes (rounded up to whole pages) backed by a memfd, so the
    /// region can also be handed to processes that are not descendants.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let size = page_aligned(size)?;

        let fd = memfd_create(c"shmsync", MFdFlags::MFD_CLOEXEC)
            .wrap_err("failed to create memory file descriptor")?;
        ftruncate(&fd, size as i64).wrap_err("failed to set memory file size")?;

        let ptr = unsafe {
            mmap(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .wrap_err("failed to map shared memory file")?
        };

        debug!(size, "mapped memfd-backed shared region");
        Ok(Memory {
            ptr: ptr.cast(),
            size,
            fd: Some(fd),
        })
    }

    /// Maps `size` bytes (rounded up to whole pages) of anonymous shared
    /// memory, visible only to this process and its descendants.
    pub(crate) fn anonymous(size: usize) -> Result<Self> {
        let size = page_aligned(size)?;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
            .wrap_err("failed to map anonymous shared memory")?
        };

        debug!(size, "mapped anonymous shared region");
        Ok(Memory {
            ptr: ptr.cast(),
            size,
            fd: None,
        })
    }

    /// Maps the whole file behind `fd`, which must hold at least `min_size`
    /// bytes.
    pub(crate) fn from_fd(fd: OwnedFd, min_size: usize) -> Result<Self> {
        let stat = fstat(&fd).wrap_err("failed to stat shared memory file")?;
        let size = stat.st_size as usize;
        ensure!(
            size >= min_size,
            ShmSyncError::SizeMismatch {
                expected: min_size,
                found: size,
            }
        );

        let ptr = unsafe {
            mmap(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .wrap_err("failed to map received shared memory file")?
        };

        debug!(size, "mapped shared region from descriptor");
        Ok(Memory {
            ptr: ptr.cast(),
            size,
            fd: Some(fd),
        })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    pub(crate) fn clone_fd(&self) -> Result<Option<OwnedFd>> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_fd().try_clone_to_owned())
            .transpose()
            .wrap_err("failed to duplicate shared memory descriptor")
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn page_aligned(size: usize) -> Result<usize> {
    let page_size = page_size();
    size.max(1)
        .checked_next_multiple_of(page_size)
        .ok_or_else(|| ShmSyncError::InvalidSize(size).into())
}

fn non_zero(size: usize) -> Result<NonZero<usize>> {
    NonZero::new(size).ok_or_else(|| ShmSyncError::InvalidSize(size).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(1)]
    #[case(4096)]
    #[case(4097)]
    #[case(3 * 4096 + 17)]
    fn test_size_rounds_up_to_pages(#[case] requested: usize) -> Result<()> {
        let memory = Memory::anonymous(requested)?;
        assert_eq!(memory.size() % page_size(), 0);
        assert!(memory.size() >= requested);
        Ok(())
    }

    #[test]
    fn test_anonymous_region_is_zeroed() -> Result<()> {
        let memory = Memory::anonymous(page_size())?;
        let ptr = memory.as_ptr().as_ptr();
        unsafe {
            for i in 0..memory.size() {
                assert_eq!(ptr.add(i).read(), 0, "nonzero byte at {}", i);
            }
        }
        assert!(memory.fd().is_none());
        Ok(())
    }

    #[test]
    fn test_second_mapping_of_fd_sees_writes() -> Result<()> {
        let memory = Memory::new(page_size() * 2)?;
        let fd = memory.clone_fd()?.expect("memfd region has a descriptor");
        let other = Memory::from_fd(fd, memory.size())?;

        assert_ne!(memory.as_ptr(), other.as_ptr());
        unsafe {
            memory.as_ptr().as_ptr().write(0xAA);
            other.as_ptr().as_ptr().add(page_size()).write(0xBB);

            assert_eq!(other.as_ptr().as_ptr().read(), 0xAA);
            assert_eq!(memory.as_ptr().as_ptr().add(page_size()).read(), 0xBB);
        }
        Ok(())
    }

    #[test]
    fn test_from_fd_rejects_short_file() -> Result<()> {
        let memory = Memory::new(page_size())?;
        let fd = memory.clone_fd()?.expect("memfd region has a descriptor");

        let err = match Memory::from_fd(fd, page_size() * 4) {
            Ok(_) => panic!("short file was accepted"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ShmSyncError>(),
            Some(ShmSyncError::SizeMismatch { .. })
        ));
        Ok(())
    }
}
