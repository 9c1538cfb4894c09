//! # Parking on an atomic word
//!
//! The only blocking facility in the crate: put the calling thread to sleep
//! until the 32-bit word at a given address changes, and wake sleepers by
//! address. Nothing here takes part in memory ordering or correctness of the
//! locks built on top. Sleeping just spares us from burning processor cycles,
//! and all of it can wake spuriously.
//!
//! Two backends, picked at build time:
//! - Linux / Android: the futex syscall, issued directly. The `_PRIVATE`
//!   operations skip the cross-process queue lookup, which is all we need
//!   since none of the primitives are shareable across address spaces.
//! - everywhere else: the `atomic-wait` crate, which maps to `__ulock_wait`
//!   on macOS, `WaitOnAddress` on Windows and futex-alikes on the BSDs.
//!
//! No timeouts, no cancellation. A parked thread comes back via a wake on its
//! address or a spurious wake-up, and callers re-check their predicate either
//! way.

use std::sync::atomic::AtomicU32;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use std::sync::atomic::AtomicU32;

    /// Sleep while `*a == expected`. Refer to the futex(2) man page.
    pub fn park(a: &AtomicU32, expected: u32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                a as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            );
        }
        // A failed syscall (EAGAIN on a changed word, EINTR on a signal)
        // counts as a spurious wake-up; the caller's loop handles it.
    }

    pub fn unpark_one(a: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                a as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    pub fn unpark_all(a: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                a as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            );
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod sys {
    use std::sync::atomic::AtomicU32;

    pub fn park(a: &AtomicU32, expected: u32) {
        atomic_wait::wait(a, expected);
    }

    pub fn unpark_one(a: &AtomicU32) {
        atomic_wait::wake_one(a as *const AtomicU32);
    }

    pub fn unpark_all(a: &AtomicU32) {
        atomic_wait::wake_all(a as *const AtomicU32);
    }
}

/// Sleep until the word at `a` is woken, provided it still holds `expected`.
pub(crate) fn park(a: &AtomicU32, expected: u32) {
    sys::park(a, expected);
}

/// Wake at most one thread parked on `a`.
pub(crate) fn unpark_one(a: &AtomicU32) {
    sys::unpark_one(a);
}

/// Wake every thread parked on `a`.
pub(crate) fn unpark_all(a: &AtomicU32) {
    sys::unpark_all(a);
}
