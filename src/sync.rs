//! Mutual exclusion usable from a protection-fault handler.
//!
//! The engine's bookkeeping is shared between ordinary calls and the
//! asynchronous trap path, so the only lock that may guard it is one that is
//! safe to take inside a signal handler: a bare spin lock. The lock is not
//! reentrant. Ordinary calls therefore block the tracked signals for their
//! whole critical section (see [`SignalBlocker`]), so a thread can never
//! fault its way back into a lock it already holds. The trap path itself
//! runs with the signal masked by the kernel and takes the plain lock.

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(unix)]
use crate::os::Signal;

/// A spin lock implemented with an atomic flag.
///
/// Acquiring it twice from the same thread deadlocks. Callers must never
/// nest acquisitions, which is what the signal masking in the engine's
/// public operations guarantees.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Busy-waits until the flag transitions unlocked -> locked.
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    /// Unconditionally resets the flag to unlocked.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Scoped acquisition of a [`SpinLock`]: acquires on construction,
/// releases on every exit path of the guarded scope.
#[derive(Debug)]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> SpinLockGuard<'a> {
    /// Acquires `lock` for the lifetime of the returned guard.
    #[must_use]
    pub fn new(lock: &'a SpinLock) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Blocks a set of signals for the current thread on construction and
/// restores the previous signal mask on drop.
#[cfg(unix)]
pub struct SignalBlocker {
    old_set: libc::sigset_t,
}

#[cfg(unix)]
impl SignalBlocker {
    /// Blocks `signals` for the calling thread until the returned value is
    /// dropped.
    #[must_use]
    pub fn new(signals: &[Signal]) -> Self {
        // # Safety
        // Plain sigset FFI; pthread_sigmask only touches the calling thread.
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            for signal in signals {
                libc::sigaddset(&mut set, *signal as i32);
            }
            let mut old_set: libc::sigset_t = core::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old_set);
            Self { old_set }
        }
    }
}

#[cfg(unix)]
impl Drop for SignalBlocker {
    fn drop(&mut self) {
        // # Safety
        // Restores the mask captured in `new` on the same thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_set, core::ptr::null_mut());
        }
    }
}

#[cfg(unix)]
impl core::fmt::Debug for SignalBlocker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalBlocker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::{SpinLock, SpinLockGuard};

    #[test]
    fn test_spin_lock_guard_releases() {
        let lock = SpinLock::new();
        {
            let _guard = SpinLockGuard::new(&lock);
        }
        // A second acquisition would deadlock if the guard leaked the lock.
        let _guard = SpinLockGuard::new(&lock);
    }

    #[test]
    fn test_spin_lock_serializes_threads() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 1000;

        let lock = Arc::new(SpinLock::new());
        // The counter is only ever touched under the lock.
        let counter = Arc::new(core::cell::UnsafeCell::new(0_usize));

        struct Shared(Arc<core::cell::UnsafeCell<usize>>);
        unsafe impl Send for Shared {}

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Shared(Arc::clone(&counter));
                thread::spawn(move || {
                    // Capture the wrapper whole, not its field, so its
                    // `Send` impl is what crosses the thread boundary.
                    let counter = counter;
                    for _ in 0..ROUNDS {
                        let _guard = SpinLockGuard::new(&lock);
                        unsafe {
                            *counter.0.get() += 1;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *counter.get() }, THREADS * ROUNDS);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_blocker_restores_mask() {
        use super::SignalBlocker;
        use crate::os::Signal;

        let before = current_mask();
        {
            let _blocked = SignalBlocker::new(&[Signal::SigSegmentationFault]);
            assert!(is_blocked(libc::SIGSEGV));
        }
        let after = current_mask();
        assert_eq!(
            unsafe { libc::sigismember(&before, libc::SIGSEGV) },
            unsafe { libc::sigismember(&after, libc::SIGSEGV) }
        );
    }

    #[cfg(unix)]
    fn current_mask() -> libc::sigset_t {
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_SETMASK, core::ptr::null(), &mut set);
            set
        }
    }

    #[cfg(unix)]
    fn is_blocked(signal: i32) -> bool {
        unsafe { libc::sigismember(&current_mask(), signal) == 1 }
    }
}
