use core::hint::spin_loop;
use core::sync::atomic::{AtomicPtr, Ordering};

static YIELD_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the scheduler's yield function used by blocking lock acquisition.
///
/// The hook can be set exactly once; returns `false` if one was already
/// installed (the existing hook stays in place).
pub fn set_yield_hook(hook: fn()) -> bool {
    let installed = YIELD_HOOK
        .compare_exchange(
            core::ptr::null_mut(),
            hook as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    if !installed {
        log::warn!("yield hook already installed; ignoring replacement");
    }
    installed
}

/// Gives up the CPU through the installed yield hook.
///
/// Before the scheduler is up there is nothing to yield to, so this degrades
/// to a spin-loop hint.
#[inline]
pub fn yield_now() {
    let hook = YIELD_HOOK.load(Ordering::Acquire);
    if hook.is_null() {
        spin_loop();
        return;
    }
    // SAFETY: only `set_yield_hook` stores into the slot, always a `fn()`.
    let hook = unsafe { core::mem::transmute::<*mut (), fn()>(hook) };
    hook();
}
