use eyre::{bail, Result, WrapErr};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

/// Exit code of a worker whose closure panicked.
pub const PANICKED: i32 = 101;

/// A forked worker process.
///
/// The closure runs in the child, whose exit code is the closure's return
/// value. Shared state has to live in a [`shmsync::Shared`] region created
/// before the fork; everything else is a private copy.
#[derive(Debug)]
pub struct Worker {
    pid: Pid,
}

impl Worker {
    pub fn spawn(f: impl FnOnce() -> i32) -> Result<Worker> {
        // SAFETY: the child runs `f` and leaves through `_exit` without
        // unwinding into the caller's frames.
        match unsafe { fork() }.wrap_err("failed to fork worker")? {
            ForkResult::Child => {
                let code = catch_unwind(AssertUnwindSafe(f)).unwrap_or(PANICKED);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), "forked worker");
                Ok(Worker { pid: child })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Waits for the worker and returns its exit code.
    pub fn join(self) -> Result<i32> {
        match waitpid(self.pid, None).wrap_err("failed to reap worker")? {
            WaitStatus::Exited(pid, code) => {
                debug!(pid = pid.as_raw(), code, "worker exited");
                Ok(code)
            }
            status => bail!("worker {} ended abnormally: {:?}", self.pid, status),
        }
    }
}

/// Joins every worker, failing if any exited with a non-zero code.
pub fn join_all(workers: impl IntoIterator<Item = Worker>) -> Result<()> {
    let mut failed = Vec::new();
    for worker in workers {
        let pid = worker.pid();
        match worker.join()? {
            0 => {}
            code => failed.push((pid, code)),
        }
    }
    if !failed.is_empty() {
        bail!("workers failed: {:?}", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn test_exit_code_is_reported(#[case] code: i32) -> Result<()> {
        let worker = Worker::spawn(|| code)?;
        assert_eq!(worker.join()?, code);
        Ok(())
    }

    #[test]
    fn test_panic_becomes_exit_code() -> Result<()> {
        let worker = Worker::spawn(|| panic!("worker failure"))?;
        assert_eq!(worker.join()?, PANICKED);
        Ok(())
    }

    #[test]
    fn test_join_all_reports_failures() -> Result<()> {
        let workers = vec![Worker::spawn(|| 0)?, Worker::spawn(|| 1)?];
        assert!(join_all(workers).is_err());
        Ok(())
    }
}
