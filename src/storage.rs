//! # The lock word
//!
//! Both locks in this crate keep their whole state in one `AtomicU32`:
//! the top bit says "held exclusively", the low 31 bits count pending
//! holders and waiters in units of 1. Packing both into one word means a
//! release is a single atomic subtraction, and "is there anybody to wake"
//! falls out of the subtraction's return value without a second atomic.
//!
//! [`LockWord`] carries the word plus the raw acquire/release steps the
//! exclusive mutex is built from. The shared lock reuses the same constants
//! on a word of its own with different semantics.

use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};
use std::sync::OnceLock;

use crate::park;

/// Top bit of the word: an exclusive holder is present or claiming.
pub(crate) const HOLDER: u32 = 1 << 31;
/// One pending holder or waiter. Also one shared holder on the shared lock.
pub(crate) const WAITER: u32 = 1;

/// State word of the exclusive mutex.
///
/// - `0` - unlocked, nobody waiting
/// - `HOLDER + n` (n >= 1) - locked, n - 1 threads waiting; the holder
///   itself keeps contributing one [`WAITER`] unit until it unlocks
///
/// The low bits alone, without `HOLDER`, only show up transiently between an
/// unlock and a parked waiter's retry.
pub(crate) struct LockWord {
    state: AtomicU32,
}

impl LockWord {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// The word itself, for the slow paths that register waiters on it.
    pub(crate) fn state(&self) -> &AtomicU32 {
        &self.state
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.load(Acquire) & HOLDER != 0
    }

    pub(crate) fn is_locked_or_waiting(&self) -> bool {
        self.state.load(Acquire) != 0
    }

    /// Held, and nobody else is registered. The holder counts as one
    /// [`WAITER`] unit, so the uncontended held state is `HOLDER + WAITER`.
    pub(crate) fn is_locked_not_waiting(&self) -> bool {
        self.state.load(Acquire) == HOLDER + WAITER
    }

    /// One-shot attempt to take the word from the free state.
    pub(crate) fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(0, HOLDER + WAITER, Acquire, Relaxed)
            .is_ok()
    }

    /// Drop the holder bit and our waiter unit in one subtraction.
    ///
    /// Returns whether other waiters were registered; the caller owes them
    /// an [`LockWord::unpark_one`] if so.
    pub(crate) fn release(&self) -> bool {
        let lk = self.state.fetch_sub(HOLDER + WAITER, Release);
        debug_assert!(lk & HOLDER != 0, "released a mutex that was not held");
        lk != HOLDER + WAITER
    }

    pub(crate) fn park_wait(&self, old: u32) {
        park::park(&self.state, old);
    }

    pub(crate) fn unpark_one(&self) {
        park::unpark_one(&self.state);
    }
}

/// Spin budget for the `spin_lock` flavors, picked once per process.
///
/// Spinning only ever pays off when another core can release the lock while
/// we burn cycles, so a single-CPU machine gets a budget of one bare retry.
pub fn default_spin_rounds() -> u32 {
    static ROUNDS: OnceLock<u32> = OnceLock::new();
    *ROUNDS.get_or_init(|| {
        match std::thread::available_parallelism() {
            Ok(n) if n.get() > 1 => 100,
            _ => 1,
        }
    })
}
