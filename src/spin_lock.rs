//! Minimal spin lock guarding the synchronized chunk pool.
//!
//! Critical sections under this lock are a handful of pointer writes, so a
//! bare test-and-set loop is enough; there is no fairness and no backoff
//! beyond the CPU spin hint.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// A 32-bit test-and-set spin lock.
#[derive(Debug, Default)]
pub struct SpinLock {
    flag: AtomicU32,
}

/// Proof that the lock is held; releases on drop, including during unwind.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the lock"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,

    // Raw-pointer marker keeps the guard !Send + !Sync.
    _marker: PhantomData<*mut ()>,
}

impl SpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: AtomicU32::new(0),
        }
    }

    /// Busy-wait until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }

    /// Single acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        if self
            .flag
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed) != 0
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.flag.load(Ordering::Relaxed), 1);
        self.lock.flag.store(0, Ordering::Release);
    }
}
