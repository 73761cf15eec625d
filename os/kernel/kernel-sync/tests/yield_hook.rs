//! Runs in its own test binary: the yield hook is process-global and can only
//! be installed once.

use kernel_sync::{SpinMutex, set_yield_hook, yield_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

static YIELDS: AtomicUsize = AtomicUsize::new(0);

fn counting_yield() {
    YIELDS.fetch_add(1, Ordering::SeqCst);
    thread::yield_now();
}

fn other_yield() {}

#[test]
fn contended_blocking_lock_goes_through_the_hook() {
    assert!(set_yield_hook(counting_yield));
    assert!(!set_yield_hook(other_yield), "hook must only install once");

    yield_now();
    assert_eq!(YIELDS.load(Ordering::SeqCst), 1);

    let lock = Arc::new(SpinMutex::new(0u32));
    let held = lock.lock_blocking();

    let waiter = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            *lock.lock_blocking() += 1;
        })
    };

    thread::sleep(Duration::from_millis(50));
    drop(held);
    waiter.join().unwrap();

    assert_eq!(*lock.lock(), 1);
    assert!(YIELDS.load(Ordering::SeqCst) > 1);
}
