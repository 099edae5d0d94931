//! Wakeup signal plumbing for blocked semaphore waiters.
//!
//! A waiter blocks [`WAKEUP_SIGNAL`], registers itself, then atomically
//! unblocks the signal and suspends with `sigsuspend`. A releaser that sends
//! the signal anywhere after registration either interrupts the suspend or
//! leaves the signal pending so the suspend returns immediately. The handler
//! does nothing; its only job is to make the suspend return.
//!
//! Signals are aimed at the suspended thread with `tgkill`, so a waiter in a
//! multi-threaded process is woken even though the other threads leave the
//! signal unblocked.

use crate::{error::ShmSyncError, shm_trace};
use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, sigaction};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{getpid, gettid};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Signal used to interrupt a suspended waiter.
pub const WAKEUP_SIGNAL: Signal = Signal::SIGUSR1;

static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_wakeup(_signal: libc::c_int) {}

/// Installs the no-op wakeup handler for this process.
///
/// Idempotent. The disposition survives `fork`, so installing it once in the
/// initializing process covers every child forked afterwards. A process that
/// `exec`s starts over with the default disposition (terminate) and must
/// install the handler again before it can be woken safely.
pub fn install_handler() -> Result<(), ShmSyncError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(on_wakeup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler touches no state, so it is async-signal-safe.
    unsafe { sigaction(WAKEUP_SIGNAL, &action) }.map_err(ShmSyncError::SignalHandler)?;

    INSTALLED.store(true, Ordering::Release);
    debug!(signal = ?WAKEUP_SIGNAL, "installed wakeup handler");
    Ok(())
}

/// Like [`install_handler`], but a failure is fatal to the process.
pub(crate) fn ensure_handler() {
    if let Err(err) = install_handler() {
        error!(%err, "cannot wait without a wakeup handler, aborting");
        std::process::abort()
    }
}

pub(crate) fn current_pid() -> libc::pid_t {
    getpid().as_raw()
}

pub(crate) fn current_tid() -> libc::pid_t {
    gettid().as_raw()
}

/// Sends the wakeup signal to thread `tid` of process `pid`. A waiter that
/// already exited is ignored.
pub(crate) fn wake(pid: libc::pid_t, tid: libc::pid_t) {
    // SAFETY: tgkill takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, WAKEUP_SIGNAL as libc::c_int) };
    if rc == 0 {
        shm_trace!(pid, tid, "sent wakeup");
        return;
    }

    match Errno::last() {
        Errno::ESRCH => {
            shm_trace!(pid, tid, "waiter exited before wakeup");
        }
        errno => debug!(pid, tid, %errno, "failed to send wakeup"),
    }
}

/// Wakeup signal blocked for the calling thread; the previous mask is
/// restored on drop.
pub(crate) struct BlockedWakeup {
    previous: SigSet,
}

impl BlockedWakeup {
    pub(crate) fn new() -> Self {
        let mut blocked = SigSet::empty();
        blocked.add(WAKEUP_SIGNAL);

        let mut previous = SigSet::empty();
        if let Err(errno) =
            pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
        {
            fatal("block wakeup signal", errno);
        }

        BlockedWakeup { previous }
    }

    /// Unblocks the wakeup signal and suspends in one step, returning after
    /// any handled signal has been delivered.
    pub(crate) fn suspend(&self) {
        let mut mask = self.previous;
        mask.remove(WAKEUP_SIGNAL);

        // SAFETY: `mask` is a valid, initialized signal set.
        let rc = unsafe { libc::sigsuspend(mask.as_ref()) };
        if rc == -1 {
            let errno = Errno::last();
            if errno != Errno::EINTR {
                fatal("suspend for wakeup", errno);
            }
        }
    }
}

impl Drop for BlockedWakeup {
    fn drop(&mut self) {
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            fatal("restore signal mask", errno);
        }
    }
}

#[cold]
fn fatal(operation: &str, errno: Errno) -> ! {
    error!(operation, %errno, "signal mask operation failed, aborting");
    std::process::abort()
}
