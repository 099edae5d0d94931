use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmSyncError {
    #[error("shared region of {0} bytes cannot be mapped")]
    InvalidSize(usize),

    #[error("shared region is {found} bytes, expected at least {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("memory mapping failed: {0}")]
    MmapFailed(String),

    #[error("failed to install wakeup signal handler: {0}")]
    SignalHandler(#[source] Errno),
}
