//! Synchronization primitives for short critical sections.
//!
//! Registries, bitmaps, and table indexes in this crate are guarded by a
//! [`SpinLock`]: contention on them is rare and the critical sections are
//! a handful of loads and stores, so spinning beats a sleep/wake round
//! trip. Anything that can block for real time — a buffer wait in the
//! cache, a deny-write drain, eviction backoff — uses the host's
//! [`Mutex`]/[`Condvar`] pair with a predicate loop instead: re-test the
//! predicate after every wakeup, never assume a signal implies it.
//!
//! [`Mutex`]: std::sync::Mutex
//! [`Condvar`]: std::sync::Condvar

pub use spin::Mutex as SpinLock;
pub use spin::MutexGuard as SpinLockGuard;
