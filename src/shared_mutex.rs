//! # Shared/update/exclusive lock
//!
//! A slim three-mode lock: any number of shared (S) holders, at most one
//! update (U) holder that still coexists with S, and an exclusive (X) holder
//! that excludes everybody. U can be upgraded to X in place and X downgraded
//! to U, which is what makes the mode worth having: a thread that will
//! probably write can sit on U without stopping readers, and only drains them
//! once it commits to writing.
//!
//! The lock composes two pieces:
//! - its own word, counting S holders in the low bits with the top bit
//!   claimed by an X acquirer,
//! - an internal [`RawMutex`], the gate, serializing U and X acquisition.
//!
//! The gate doubles as a second parking queue. An X acquirer takes the gate,
//! raises the top bit and then parks on the word until residual readers
//! drain; newcomer readers that see the bit fall back to queueing on the
//! gate instead. Keeping those two crowds on separate queues means a reader
//! unlocking never wakes a herd, only the last reader out issues a single
//! wake to the one X waiter.
//!
//! A U holder does not show up in the gate's word alone: it also adds one
//! reader unit to the lock word, so an X acquirer behind it counts it like
//! any other reader it has to wait out on upgrade.

use std::{
    cell::UnsafeCell,
    mem,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use crate::mutex::RawMutex;
use crate::park;
use crate::storage::{HOLDER, WAITER};

/// The bare three-mode lock, no payload.
///
/// Word states:
/// - `0` - free
/// - `n` with `0 < n < HOLDER` - n shared holders (a U holder counts as one)
/// - `HOLDER` - held exclusively
/// - `HOLDER + n` - an X acquirer waiting for n residual shared holders
pub struct RawSharedMutex {
    word: AtomicU32,
    gate: RawMutex,
}

impl RawSharedMutex {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            gate: RawMutex::new(),
        }
    }

    /// Whether the lock is held exclusively, with all readers drained.
    pub fn is_locked(&self) -> bool {
        self.word.load(Acquire) == HOLDER
    }

    /// Whether any U or X activity is pending, or X is held.
    pub fn is_locked_or_waiting(&self) -> bool {
        self.gate.is_locked_or_waiting() || self.is_locked()
    }

    /// Try to take a shared lock. Fails only against a present or pending
    /// exclusive holder.
    pub fn try_lock_shared(&self) -> bool {
        let mut lk = 0;
        loop {
            match self
                .word
                .compare_exchange_weak(lk, lk + WAITER, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(e) => {
                    if e & HOLDER != 0 {
                        return false;
                    }
                    lk = e;
                }
            }
        }
    }

    pub fn lock_shared(&self) {
        if !self.try_lock_shared() {
            self.shared_lock_wait();
        }
    }

    /// Like [`RawSharedMutex::lock_shared`] with a spinning first pass
    /// through the gate.
    pub fn spin_lock_shared(&self) {
        if self.try_lock_shared() {
            return;
        }
        self.gate.spin_lock();
        let acquired = self.try_lock_shared();
        // SAFETY: taken three lines up
        unsafe { self.gate.unlock() };
        if !acquired {
            self.shared_lock_wait();
        }
    }

    /// Try to take the update lock. Fails against another U or X holder.
    pub fn try_lock_update(&self) -> bool {
        if !self.gate.try_lock() {
            return false;
        }
        self.shared_acquire();
        true
    }

    pub fn lock_update(&self) {
        self.gate.lock();
        self.shared_acquire();
    }

    pub fn spin_lock_update(&self) {
        self.gate.spin_lock();
        self.shared_acquire();
    }

    /// Try to take the exclusive lock. Fails against any other holder.
    pub fn try_lock(&self) -> bool {
        if !self.gate.try_lock() {
            return false;
        }
        if self
            .word
            .compare_exchange(0, HOLDER, Acquire, Relaxed)
            .is_ok()
        {
            return true;
        }
        // SAFETY: taken at the top of this function
        unsafe { self.gate.unlock() };
        false
    }

    pub fn lock(&self) {
        self.gate.lock();
        self.exclusive_acquire();
    }

    pub fn spin_lock(&self) {
        self.gate.spin_lock();
        self.exclusive_acquire();
    }

    /// Turn a held update lock into an exclusive one, draining readers.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock.
    pub unsafe fn update_lock_upgrade(&self) {
        debug_assert!(self.gate.is_locked());
        // swap our reader unit for the holder bit in one addition
        let lk = self.word.fetch_add(HOLDER - WAITER, Acquire);
        if lk != WAITER {
            self.exclusive_lock_wait(lk - WAITER);
        }
    }

    /// Turn a held exclusive lock into an update lock.
    ///
    /// Shared waiters already queued on the gate stay there until the
    /// matching [`RawSharedMutex::unlock_update`]; only fresh arrivals get
    /// in right away.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive lock.
    pub unsafe fn lock_update_downgrade(&self) {
        debug_assert!(self.gate.is_locked());
        debug_assert!(self.is_locked());
        self.word.store(WAITER, Release);
    }

    /// Release a shared lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared lock.
    pub unsafe fn unlock_shared(&self) {
        let lk = self.word.fetch_sub(WAITER, Release);
        debug_assert!(lk & !HOLDER != 0, "shared count underflow");
        if lk == HOLDER + WAITER {
            // we were the last reader an X acquirer was waiting out
            park::unpark_one(&self.word);
        }
    }

    /// Release the update lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock.
    pub unsafe fn unlock_update(&self) {
        let lk = self.word.fetch_sub(WAITER, Release);
        debug_assert!(lk != 0 && lk < HOLDER);
        // SAFETY: the update holder owns the gate
        unsafe { self.gate.unlock() };
    }

    /// Release the exclusive lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive lock.
    pub unsafe fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.word.store(0, Release);
        // SAFETY: the exclusive holder owns the gate
        unsafe { self.gate.unlock() };
    }

    /// S slow path: queue on the gate so an X waiter holding it blocks us,
    /// then retry under the gate. Looping covers the window where another X
    /// acquirer slips in between our gate release and the retry.
    #[cold]
    fn shared_lock_wait(&self) {
        loop {
            self.gate.lock();
            let acquired = self.try_lock_shared();
            // SAFETY: taken two lines up
            unsafe { self.gate.unlock() };
            if acquired {
                return;
            }
        }
    }

    /// Register one shared unit while holding the gate.
    fn shared_acquire(&self) {
        debug_assert!(self.gate.is_locked());
        let lk = self.word.fetch_add(WAITER, Acquire);
        debug_assert!(lk < HOLDER - WAITER, "shared count overflow");
    }

    /// Raise the holder bit while holding the gate, then wait out readers.
    fn exclusive_acquire(&self) {
        debug_assert!(self.gate.is_locked());
        // The gate guarantees the top bit is clear here, so adding it is the
        // same as or-ing it in. On IA-32 and AMD64 a single-bit fetch_or
        // lowers to a CMPXCHG loop while fetch_add is one locked XADD.
        let lk = if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            self.word.fetch_add(HOLDER, Acquire)
        } else {
            self.word.fetch_or(HOLDER, Acquire)
        };
        if lk != 0 {
            self.exclusive_lock_wait(lk);
        }
    }

    /// Park on the word until the residual readers have all left.
    /// `lk` is a recent count of them, without the holder bit.
    #[cold]
    fn exclusive_lock_wait(&self, lk: u32) {
        debug_assert!(self.gate.is_locked());
        debug_assert!(lk != 0 && lk < HOLDER);
        let mut lk = lk | HOLDER;
        loop {
            debug_assert!(lk > HOLDER);
            park::park(&self.word, lk);
            lk = self.word.load(Acquire);
            if lk == HOLDER {
                return;
            }
        }
    }
}

impl Default for RawSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Three-mode lock protecting a value.
pub struct SharedMutex<T> {
    raw: RawSharedMutex,
    value: UnsafeCell<T>,
}

// Shared guards hand out &T from several threads at once, so T must be Sync
// on top of Send.
unsafe impl<T: Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSharedMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> SharedGuard<'_, T> {
        self.raw.lock_shared();
        SharedGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<SharedGuard<'_, T>> {
        self.raw.try_lock_shared().then(|| SharedGuard { lock: self })
    }

    pub fn spin_read(&self) -> SharedGuard<'_, T> {
        self.raw.spin_lock_shared();
        SharedGuard { lock: self }
    }

    pub fn update(&self) -> UpdateGuard<'_, T> {
        self.raw.lock_update();
        UpdateGuard { lock: self }
    }

    pub fn try_update(&self) -> Option<UpdateGuard<'_, T>> {
        self.raw.try_lock_update().then(|| UpdateGuard { lock: self })
    }

    pub fn spin_update(&self) -> UpdateGuard<'_, T> {
        self.raw.spin_lock_update();
        UpdateGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.lock();
        WriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.raw.try_lock().then(|| WriteGuard { lock: self })
    }

    pub fn spin_write(&self) -> WriteGuard<'_, T> {
        self.raw.spin_lock();
        WriteGuard { lock: self }
    }

    /// The raw lock, for callers composing their own protocol on top.
    pub fn raw(&self) -> &RawSharedMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared (read) access. Many of these may exist at once.
pub struct SharedGuard<'a, T> {
    pub(crate) lock: &'a SharedMutex<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: shared holders exclude any writer
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard holds a shared lock
        unsafe { self.lock.raw.unlock_shared() }
    }
}

/// Update access: read-only, exclusive against other U and X, upgradable.
pub struct UpdateGuard<'a, T> {
    pub(crate) lock: &'a SharedMutex<T>,
}

impl<'a, T> UpdateGuard<'a, T> {
    /// Wait out the current readers and come back with write access.
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        // SAFETY: the consumed guard held the update lock
        unsafe { lock.raw.update_lock_upgrade() };
        WriteGuard { lock }
    }
}

impl<T> Deref for UpdateGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the update holder excludes any writer
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for UpdateGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the update lock
        unsafe { self.lock.raw.unlock_update() }
    }
}

/// Exclusive (write) access.
pub struct WriteGuard<'a, T> {
    pub(crate) lock: &'a SharedMutex<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Step down to update mode. Readers queued while we held X stay blocked
    /// until the returned guard is dropped; fresh readers get in right away.
    pub fn downgrade(self) -> UpdateGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        // SAFETY: the consumed guard held the exclusive lock
        unsafe { lock.raw.lock_update_downgrade() };
        UpdateGuard { lock }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the exclusive holder excludes everybody
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive holder excludes everybody
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the exclusive lock
        unsafe { self.lock.raw.unlock() }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Word trace of the uncontended paths.
    #[test]
    fn test_uncontended_word_trace() {
        let m = RawSharedMutex::new();
        assert_eq!(m.word.load(Relaxed), 0);

        m.lock();
        assert_eq!(m.word.load(Relaxed), HOLDER);
        assert!(m.is_locked());
        unsafe { m.unlock() };
        assert_eq!(m.word.load(Relaxed), 0);

        m.lock_shared();
        assert_eq!(m.word.load(Relaxed), WAITER);
        assert!(!m.is_locked());
        unsafe { m.unlock_shared() };
        assert_eq!(m.word.load(Relaxed), 0);

        m.lock_update();
        assert_eq!(m.word.load(Relaxed), WAITER);
        assert!(m.gate.is_locked());
        unsafe { m.unlock_update() };
        assert_eq!(m.word.load(Relaxed), 0);
        assert!(!m.is_locked_or_waiting());
    }

    #[test]
    fn test_readers_coexist() {
        let m = SharedMutex::new(7);
        let a = m.read();
        let b = m.read();
        assert_eq!(*a + *b, 14);
    }

    #[test]
    fn test_writer_excludes_and_is_excluded() {
        let m = SharedMutex::new(0);
        {
            let _r = m.read();
            assert!(m.try_write().is_none());
            assert!(m.try_update().is_some()); // U coexists with S
        }
        {
            let _w = m.write();
            assert!(m.try_read().is_none());
            assert!(m.try_update().is_none());
            assert!(m.try_write().is_none());
        }
        assert!(m.try_write().is_some());
    }

    #[test]
    fn test_single_update_holder() {
        let m = SharedMutex::new(0);
        let u = m.update();
        assert!(m.try_update().is_none());
        drop(u);
        assert!(m.try_update().is_some());
    }

    /// Two sleeping readers, one writer. The writer has to wait for both,
    /// and the last one out hands over a word that is exactly HOLDER.
    #[test]
    fn test_writer_waits_for_residual_readers() {
        let m = SharedMutex::new(0);
        let readers_in = AtomicUsize::new(0);
        let readers_done = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let g = m.read();
                    readers_in.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(200));
                    readers_done.fetch_add(1, Ordering::Relaxed);
                    drop(g);
                });
            }
            while readers_in.load(Ordering::Relaxed) < 2 {
                thread::yield_now();
            }
            let mut g = m.write();
            assert_eq!(readers_done.load(Ordering::Relaxed), 2);
            assert!(m.raw().is_locked());
            *g = 1;
        });
        assert_eq!(*m.read(), 1);
    }

    /// Update then upgrade with a concurrent reader: the reader gets in
    /// during the update phase and the upgrade drains it before returning.
    #[test]
    fn test_upgrade_drains_readers() {
        let m = SharedMutex::new(0);
        let reader_in = AtomicBool::new(false);
        let reader_released = AtomicBool::new(false);
        thread::scope(|s| {
            let u = m.update();
            s.spawn(|| {
                let g = m.read(); // coexists with the update holder
                reader_in.store(true, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(200));
                reader_released.store(true, Ordering::Relaxed);
                drop(g);
            });
            while !reader_in.load(Ordering::Relaxed) {
                thread::yield_now();
            }
            assert_eq!(m.raw().word.load(Relaxed), 2 * WAITER);
            let mut w = u.upgrade(); // parks until the reader leaves
            assert!(reader_released.load(Ordering::Relaxed));
            *w = 9;
        });
        assert_eq!(*m.read(), 9);
    }

    /// Writes made under X stay visible to a reader admitted after the
    /// downgrade, and a reader queued during X does not get in before
    /// the update guard is gone.
    #[test]
    fn test_downgrade_publishes_writes() {
        let m = SharedMutex::new(0);
        let reader_started = AtomicBool::new(false);
        let update_released = AtomicBool::new(false);
        thread::scope(|s| {
            let mut w = m.write();
            s.spawn(|| {
                reader_started.store(true, Ordering::Relaxed);
                let g = m.read(); // queued behind the X holder's gate
                assert!(update_released.load(Ordering::Relaxed));
                assert_eq!(*g, 42);
            });
            while !reader_started.load(Ordering::Relaxed) {
                thread::yield_now();
            }
            // give the reader time to park in the gated retry loop
            thread::sleep(Duration::from_millis(100));
            *w = 42;
            let u = w.downgrade();
            thread::sleep(Duration::from_millis(100)); // reader must stay out
            update_released.store(true, Ordering::Relaxed);
            drop(u);
        });
    }

    /// Fresh readers get in right after a downgrade, before the update
    /// guard is released.
    #[test]
    fn test_downgrade_admits_fresh_readers() {
        let m = SharedMutex::new(1);
        let w = m.write();
        let u = w.downgrade();
        let r = m.try_read();
        assert!(r.is_some());
        assert_eq!(*r.unwrap(), 1);
        drop(u);
    }

    /// Exclusivity property under load: readers and writers mixed, with a
    /// violation counter checked inside every critical section.
    #[test]
    fn test_mixed_load_exclusion() {
        let m = SharedMutex::new(0usize);
        let writers = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        let mut g = m.write();
                        assert_eq!(writers.fetch_add(1, Ordering::Relaxed), 0);
                        *g += 1;
                        writers.fetch_sub(1, Ordering::Relaxed);
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        let g = m.read();
                        assert_eq!(writers.load(Ordering::Relaxed), 0);
                        std::hint::black_box(*g);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..1_000 {
                    let u = m.update();
                    assert_eq!(writers.load(Ordering::Relaxed), 0);
                    let mut w = u.upgrade();
                    assert_eq!(writers.fetch_add(1, Ordering::Relaxed), 0);
                    *w += 1;
                    writers.fetch_sub(1, Ordering::Relaxed);
                    drop(w.downgrade());
                }
            });
        });
        assert_eq!(*m.read(), 2 * 10_000 + 1_000);
    }

    /// The spinning flavors take and release like the plain ones.
    #[test]
    fn test_spin_flavors() {
        let m = SharedMutex::new(5);
        {
            let g = m.spin_read();
            assert_eq!(*g, 5);
        }
        {
            let u = m.spin_update();
            assert_eq!(*u, 5);
        }
        {
            let mut w = m.spin_write();
            *w = 6;
        }
        assert_eq!(*m.read(), 6);
    }
}
