//! Multi-process checks for the `shmsync` primitives.
//!
//! Every scenario forks real worker processes that share a region mapped by
//! the caller, mirroring how the primitives are meant to be used. The
//! `shmsync-harness` binary runs them from the command line.

pub mod scenarios;
pub mod worker;

pub use scenarios::Report;
pub use worker::Worker;
