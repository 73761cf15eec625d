use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set spin lock guarding one allocator instance.
///
/// Waiters only read the flag while it is held, so the cache line stays
/// shared until the owner releases it.
pub struct RawSpin {
    locked: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Whether some owner currently holds the lock. Only a hint.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        while !self.acquire() {
            while self.is_locked() {
                spin_loop();
            }
        }
    }

    fn raw_try_lock(&self) -> bool {
        !self.is_locked() && self.acquire()
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of a free spin lock");
        self.locked.store(false, Ordering::Release);
    }
}
