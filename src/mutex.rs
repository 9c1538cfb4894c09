//! # Exclusive mutex
//!
//! Non-recursive mutex over one [`LockWord`]. The fast path is a single
//! compare-and-exchange; the contended path registers itself in the word's
//! waiter count before parking, so an unlock can tell from its own
//! subtraction whether a wake syscall is owed at all. If there are no races
//! for the lock, neither the park nor the wake syscall is ever issued.
//!
//! There is no handover: the releaser wakes one waiter and the woken thread
//! competes on the compare-and-exchange like everybody else. A thread that
//! arrives right at that moment may well barge in front; we promise mutual
//! exclusion, not fairness.
//!
//! [`Mutex<T>`] wraps the raw lock around an `UnsafeCell` payload with the
//! usual guard, which is how anything outside this crate should consume it.

use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering::{Acquire, Relaxed},
};

use crate::storage::{default_spin_rounds, LockWord, HOLDER, WAITER};

/// The bare lock: one atomic word, no payload, no guard.
///
/// Zero-initialized is unlocked. Dropping it owns no kernel resource; the
/// kernel queue is keyed on the address of the word itself, which also means
/// the lock must stay put while anyone is parked on it. Every blocking
/// operation borrows `self` for its whole duration, so the borrow checker
/// already enforces that.
pub struct RawMutex {
    word: LockWord,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            word: LockWord::new(),
        }
    }

    /// One attempt, no blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.word.try_acquire()
    }

    /// Acquire, parking if somebody else holds the lock.
    #[inline]
    pub fn lock(&self) {
        if !self.word.try_acquire() {
            self.wait_and_lock();
        }
    }

    /// Like [`RawMutex::lock`], but burn a few rounds on the CPU first in
    /// case the holder is about to let go. Budget from [`default_spin_rounds`].
    #[inline]
    pub fn spin_lock(&self) {
        self.spin_lock_rounds(default_spin_rounds());
    }

    /// [`RawMutex::spin_lock`] with an explicit spin budget.
    #[inline]
    pub fn spin_lock_rounds(&self, rounds: u32) {
        if !self.word.try_acquire() {
            self.spin_wait_and_lock(rounds);
        }
    }

    /// Release the lock and wake one waiter if any is registered.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock. Unlocking a mutex held by
    /// another thread (or by nobody) breaks whatever that lock was
    /// protecting.
    #[inline]
    pub unsafe fn unlock(&self) {
        if self.word.release() {
            self.word.unpark_one();
        }
    }

    /// Whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.word.is_locked()
    }

    /// Whether the lock is held or any thread is registered for it.
    pub fn is_locked_or_waiting(&self) -> bool {
        self.word.is_locked_or_waiting()
    }

    /// Whether the lock is held with no other thread registered.
    pub fn is_locked_not_waiting(&self) -> bool {
        self.word.is_locked_not_waiting()
    }

    /// Contended path: register in the waiter count, then alternate between
    /// parking while the holder bit is up and racing the CAS when it is not.
    /// A spurious wake just loops back into another park.
    #[cold]
    fn wait_and_lock(&self) {
        let word = self.word.state();
        let mut lk = word.fetch_add(WAITER, Relaxed) + WAITER;
        debug_assert!(lk & !HOLDER != 0, "waiter count overflowed");
        loop {
            if lk & HOLDER != 0 {
                self.word.park_wait(lk);
                lk = word.load(Relaxed);
            } else {
                // our waiter unit is already in lk; only the bit is missing
                match word.compare_exchange_weak(lk, lk | HOLDER, Acquire, Relaxed) {
                    Ok(_) => return,
                    Err(e) => lk = e,
                }
            }
        }
    }

    /// Contended path with an initial spin, still unregistered: a relaxed
    /// load costs nothing on the cache compared to a failed CAS, so only
    /// attempt the CAS when the holder bit is down.
    #[cold]
    fn spin_wait_and_lock(&self, rounds: u32) {
        let word = self.word.state();
        let mut lk = word.load(Relaxed);
        for _ in 0..rounds {
            if lk & HOLDER == 0 {
                // not registered yet, so claim the bit and a waiter unit
                match word.compare_exchange_weak(lk, lk + (HOLDER + WAITER), Acquire, Relaxed) {
                    Ok(_) => return,
                    Err(e) => {
                        lk = e;
                        continue;
                    }
                }
            }
            hint::spin_loop();
            lk = word.load(Relaxed);
        }
        self.wait_and_lock();
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive mutex protecting a value.
pub struct Mutex<T> {
    raw: RawMutex,
    value: UnsafeCell<T>,
}

// Safe to share as long as the protected value can move between threads.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn spin_lock(&self) -> MutexGuard<'_, T> {
        self.raw.spin_lock();
        MutexGuard { mutex: self }
    }

    /// The raw lock, for callers composing their own protocol on top.
    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    /// No locking needed through an exclusive reference.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct MutexGuard<'a, T> {
    pub(crate) mutex: &'a Mutex<T>,
}

unsafe impl<T: Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard was created by a successful acquire
        unsafe { self.mutex.raw.unlock() }
    }
}
