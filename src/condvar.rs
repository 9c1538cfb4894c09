//! # Condition variable
//!
//! One atomic counter of outstanding waiters, parked on directly. A wait
//! registers itself with `fetch_add`, releases the caller's lock, parks on
//! the counter and reacquires the lock in the same mode afterwards. Works
//! with all three modes of [`SharedMutex`](crate::SharedMutex) as well as
//! the plain [`Mutex`](crate::Mutex).
//!
//! `signal` and `broadcast` exchange the counter back to 0 in one atomic
//! step, so every racing wait either got its increment in before the
//! exchange (and the wake covers it) or registers against the fresh zero
//! baseline and needs no wake. A stale parked waiter whose expected value no
//! longer matches is simply returned early by the parking primitive. The
//! counter's only purpose is to skip the wake syscall on the common
//! "nobody is waiting" path; waiting itself is expected to be slow anyway.
//!
//! As with any condition variable, wake-ups can be spurious and a woken
//! thread may find the predicate still false, so callers test it in a loop.

use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Release},
};

use crate::mutex::MutexGuard;
use crate::park;
use crate::shared_mutex::{SharedGuard, UpdateGuard, WriteGuard};

pub struct Condvar {
    waiters: AtomicU32,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicU32::new(0),
        }
    }

    /// Whether any thread is currently registered in a wait.
    pub fn is_waiting(&self) -> bool {
        self.waiters.load(Acquire) != 0
    }

    /// Wake one waiter, if there is anybody to wake.
    pub fn signal(&self) {
        if self.waiters.swap(0, Release) != 0 {
            park::unpark_one(&self.waiters);
        }
    }

    /// Wake every waiter, if there is anybody to wake.
    pub fn broadcast(&self) {
        if self.waiters.swap(0, Release) != 0 {
            park::unpark_all(&self.waiters);
        }
    }

    /// Release the mutex, sleep until signalled and lock it again.
    ///
    /// The returned guard proves reacquisition, not the predicate; check
    /// that in a loop around this call.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let val = self.register();
        let mutex = guard.mutex;
        drop(guard);
        park::park(&self.waiters, val + 1);
        mutex.lock()
    }

    /// [`Condvar::wait`] for an exclusive lock on a [`SharedMutex`].
    pub fn wait_exclusive<'a, T>(&self, guard: WriteGuard<'a, T>) -> WriteGuard<'a, T> {
        let val = self.register();
        let lock = guard.lock;
        drop(guard);
        park::park(&self.waiters, val + 1);
        lock.write()
    }

    /// [`Condvar::wait`] for a shared lock.
    pub fn wait_shared<'a, T>(&self, guard: SharedGuard<'a, T>) -> SharedGuard<'a, T> {
        let val = self.register();
        let lock = guard.lock;
        drop(guard);
        park::park(&self.waiters, val + 1);
        lock.read()
    }

    /// [`Condvar::wait`] for an update lock.
    pub fn wait_update<'a, T>(&self, guard: UpdateGuard<'a, T>) -> UpdateGuard<'a, T> {
        let val = self.register();
        let lock = guard.lock;
        drop(guard);
        park::park(&self.waiters, val + 1);
        lock.update()
    }

    /// Count ourselves in before letting go of the lock, so a notifier that
    /// runs in between sees us and wakes.
    fn register(&self) -> u32 {
        self.waiters.fetch_add(1, Acquire)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mutex::Mutex;
    use crate::shared_mutex::SharedMutex;
    use std::sync::atomic::Ordering::Relaxed;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_and_signal() {
        let mutex = Mutex::new(0);
        let condvar = Condvar::new();
        let mut wakeups = 0;
        thread::scope(|s| {
            s.spawn(|| {
                // let the other thread get into its wait first
                thread::sleep(Duration::from_millis(200));
                *mutex.lock() = 123;
                condvar.signal();
            });
            let mut g = mutex.lock();
            while *g < 100 {
                g = condvar.wait(g);
                wakeups += 1;
            }
            assert_eq!(*g, 123);
        });
        // the wait happened, modulo a few spurious rounds
        assert!(wakeups < 10);
    }

    /// With nobody waiting, notifications are free and change nothing.
    #[test]
    fn test_signal_without_waiters_is_noop() {
        let cv = Condvar::new();
        assert!(!cv.is_waiting());
        cv.signal();
        cv.broadcast();
        assert!(!cv.is_waiting());
        assert_eq!(cv.waiters.load(Relaxed), 0);
    }

    #[test]
    fn test_is_waiting_tracks_waiters() {
        let mutex = Mutex::new(false);
        let cv = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                let mut g = mutex.lock();
                while !*g {
                    g = cv.wait(g);
                }
            });
            while !cv.is_waiting() {
                thread::yield_now();
            }
            *mutex.lock() = true;
            cv.signal();
        });
        // the exchange reset the counter on its way out
        assert_eq!(cv.waiters.load(Relaxed), 0);
    }

    #[test]
    fn test_broadcast_wakes_everyone() {
        let mutex = Mutex::new(false);
        let cv = Condvar::new();
        let woken = std::sync::atomic::AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut g = mutex.lock();
                    while !*g {
                        g = cv.wait(g);
                    }
                    woken.fetch_add(1, Relaxed);
                });
            }
            thread::sleep(Duration::from_millis(200));
            *mutex.lock() = true;
            cv.broadcast();
        });
        assert_eq!(woken.load(Relaxed), 4);
        assert_eq!(cv.waiters.load(Relaxed), 0);
    }

    #[test]
    fn test_wait_shared() {
        let m = SharedMutex::new(false);
        let cv = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                *m.write() = true;
                cv.broadcast();
            });
            let mut g = m.read();
            while !*g {
                g = cv.wait_shared(g);
            }
        });
    }

    #[test]
    fn test_wait_update() {
        let m = SharedMutex::new(0);
        let cv = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                *m.write() = 7;
                cv.signal();
            });
            let mut g = m.update();
            while *g == 0 {
                g = cv.wait_update(g);
            }
            // still the update holder afterwards, so an upgrade must work
            let w = g.upgrade();
            assert_eq!(*w, 7);
        });
    }

    #[test]
    fn test_wait_exclusive() {
        let m = SharedMutex::new(0);
        let cv = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                *m.write() = 1;
                cv.signal();
            });
            let mut g = m.write();
            while *g == 0 {
                g = cv.wait_exclusive(g);
            }
            assert_eq!(*g, 1);
        });
    }
}
