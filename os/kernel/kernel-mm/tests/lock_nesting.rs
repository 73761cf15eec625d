//! Runs in its own test binary: the yield hook is process-global and can only
//! be installed once.

mod common;

use common::{Machine, TestSpace};
use kernel_mm::{FaultAccess, MappingFlags, PageFault};
use kernel_sync::set_yield_hook;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

static YIELDS: AtomicUsize = AtomicUsize::new(0);

fn counting_yield() {
    YIELDS.fetch_add(1, Ordering::SeqCst);
    thread::yield_now();
}

const RW_USER: MappingFlags = MappingFlags::READ
    .union(MappingFlags::WRITE)
    .union(MappingFlags::USER);

#[test]
fn space_operations_never_yield_while_holding_the_registry() {
    assert!(set_yield_hook(counting_yield));
    let m = Machine::boot(128);
    let space = TestSpace::new_user(&m.ctx).unwrap();
    let heap = space.map_anonymous(4 * 4096, RW_USER).unwrap();

    thread::scope(|s| {
        // Contend on the frame allocator while each operation holds the
        // registry and then needs frames.
        let held = m.ctx.frames().lock_blocking();
        let worker = s.spawn(|| {
            let stack = space.alloc_user_pages(2, RW_USER, true).unwrap();
            assert!(space
                .handle_fault(&PageFault::new(heap, FaultAccess::Write, true))
                .is_resolved());
            let child = space.fork_cow().unwrap();
            drop(child);
            space.unmap(stack).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(YIELDS.load(Ordering::SeqCst), 0);
        drop(held);
        worker.join().unwrap();
    });
    assert_eq!(YIELDS.load(Ordering::SeqCst), 0);

    // Plain task-context allocation still yields under contention.
    thread::scope(|s| {
        let held = m.ctx.frames().lock_blocking();
        let waiter = s.spawn(|| m.ctx.free_frames());
        thread::sleep(Duration::from_millis(50));
        drop(held);
        waiter.join().unwrap();
    });
    assert!(YIELDS.load(Ordering::SeqCst) > 0);
}
