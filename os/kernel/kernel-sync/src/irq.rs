//! Interrupt masking for spinning critical sections.
//!
//! On the bare-metal x86-64 target the guard uses `cli`/`sti` and reads the
//! `IF` bit from `RFLAGS`. Hosted builds (unit tests) have no interrupt flag to
//! manipulate, so the guard only records that it was taken.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};

/// A mutex guard that also disables interrupts while held.
///
/// Created via [`Mutex::lock_irq`]: interrupts are disabled first, then the
/// lock is acquired by spinning; on drop the lock is released before the
/// previous interrupt state is restored.
///
/// This is the acquisition flavor for code that may run inside an interrupt
/// handler (the page-fault path, the TLB shootdown IPI) or that nests inside
/// another spinning critical section.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinMutex;
///
/// static FRAMES: SpinMutex<u64> = SpinMutex::new(0);
///
/// {
///     let mut g = FRAMES.lock_irq();
///     *g += 1;
/// }
/// assert_eq!(*FRAMES.lock_blocking(), 1);
/// ```
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the lock is released before interrupts come back.
    g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.g
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.g
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Never yields; safe to call from interrupt context.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let ig = IrqGuard::new();
        let g = self.lock();
        IrqMutex { g, _irq: ig }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Disables hardware interrupts (`cli`).
    #[inline]
    pub fn cli_stop_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    #[inline]
    pub fn sti_enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns `true` if `RFLAGS.IF` is set.
    #[inline]
    #[must_use]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        (r & (1 << 9)) != 0
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn cli_stop_interrupts() {}

    #[inline]
    pub const fn sti_enable_interrupts() {}

    #[inline]
    #[must_use]
    pub const fn interrupts_enabled() -> bool {
        false
    }
}

pub use arch::{cli_stop_interrupts, interrupts_enabled, sti_enable_interrupts};

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
