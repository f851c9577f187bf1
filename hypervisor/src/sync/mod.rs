//! Synchronization primitives usable on the VM-exit path.
//!
//! Nothing here blocks or sleeps: a logical processor handling a VM-exit may only spin.
//! Both primitives share the same exponential [`Backoff`] policy between attempts.

pub mod backoff;
pub mod once;
pub mod spinlock;

pub use {backoff::Backoff, once::OnceInit, spinlock::{SpinLock, SpinLockGuard}};
