//! # wordsync
//!
//! Small synchronization primitives that each keep their whole state in one
//! 32-bit atomic word and sleep through the operating system's wait-on-address
//! facility. Compared to the standard library primitives they are smaller
//! (four bytes of state for a mutex, twelve for the three-mode lock), cheaper
//! when uncontended (one compare-and-exchange in, one subtraction out, no
//! syscall unless somebody actually waits) and richer in modes: the
//! [`SharedMutex`] knows shared, update and exclusive locking with in-place
//! upgrade and downgrade.
//!
//! What they are not: recursive, fair, poisoning, or timeout-capable. A
//! thread that takes a lock twice deadlocks. Whoever needs those features
//! can wrap these primitives or use `std::sync`.
//!
//! The zoo:
//! - [`Mutex`] / [`RawMutex`]: non-recursive exclusive mutex with optional
//!   initial spin.
//! - [`SharedMutex`] / [`RawSharedMutex`]: slim reader-writer lock with the
//!   extra update mode.
//! - [`Condvar`]: condition variable composing with all of the above.
//!
//! The `Raw*` types carry no payload and make release-side misuse the
//! caller's problem (`unsafe`); the plain types wrap a value and hand out
//! guards.

mod condvar;
mod mutex;
mod park;
mod shared_mutex;
mod storage;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use shared_mutex::{RawSharedMutex, SharedGuard, SharedMutex, UpdateGuard, WriteGuard};
pub use storage::default_spin_rounds;
