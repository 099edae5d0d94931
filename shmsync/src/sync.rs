#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Gives up the rest of the scheduling quantum (`sched_yield`).
#[cfg(not(feature = "loom"))]
#[inline]
pub(crate) fn yield_now() {
    std::thread::yield_now();
}

#[cfg(feature = "loom")]
#[inline]
pub(crate) fn yield_now() {
    loom::thread::yield_now();
}
