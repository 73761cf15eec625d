//! # Kernel synchronization primitives
//!
//! Every allocator instance of the memory-management core sits behind one
//! [`Mutex`] that can be acquired in two flavors:
//!
//! * [`Mutex::lock_blocking`] for ordinary task context: spins briefly, then
//!   gives the CPU back through the scheduler's [yield hook](set_yield_hook)
//!   while the lock stays contended.
//! * [`Mutex::lock_irq`] for nested critical sections and interrupt context:
//!   busy-waits with interrupts disabled and never yields.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod yield_hook;

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use yield_hook::{set_yield_hook, yield_now};

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
