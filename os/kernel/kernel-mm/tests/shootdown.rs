mod common;

use common::{RAM_BASE, Ram};
use kernel_alloc::OffsetPhysMapper;
use kernel_info::memory::{MemoryLayout, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_mm::{
    FaultAccess, MappingFlags, MemoryContext, MemoryContextBuilder, PageFault, VmSpace, VmmError,
};
use kernel_vmem::{CpuId, ShootdownError, TlbPlatform};
use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
}

#[derive(Default)]
struct TwoCores {
    flushes: Mutex<Vec<(CpuId, u64, u64)>>,
}

impl TlbPlatform for TwoCores {
    fn current_cpu(&self) -> CpuId {
        CPU.with(Cell::get)
    }

    fn flush_local(&self, va: VirtualAddress, pages: u64) {
        self.flushes
            .lock()
            .unwrap()
            .push((self.current_cpu(), va.as_u64(), pages));
    }

    fn send_invalidate_ipi(&self, _cpu: CpuId) {}
}

fn boot(ram: &mut Ram, budget: u64) -> MemoryContext<OffsetPhysMapper, TwoCores> {
    let layout = MemoryLayout {
        shootdown_budget: budget,
        ..common::layout()
    };
    MemoryContextBuilder::new(layout)
        .add_region(PhysicalAddress::new(RAM_BASE), ram.size())
        .cpus(2)
        .build(ram.mapper(), TwoCores::default())
        .unwrap()
}

const RW_USER: MappingFlags = MappingFlags::READ
    .union(MappingFlags::WRITE)
    .union(MappingFlags::USER);

#[test]
fn unmap_reaches_every_active_core() {
    let mut ram = Ram::new(64);
    let ctx = boot(&mut ram, u64::MAX);
    let space = VmSpace::new_user(&ctx).unwrap();
    space.mark_active(0);
    space.mark_active(1);

    let base = space.map_anonymous(PAGE_SIZE, RW_USER).unwrap();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            CPU.with(|c| c.set(1));
            while !stop.load(Ordering::Acquire) {
                ctx.handle_shootdown_ipi(1);
                std::thread::yield_now();
            }
        });
        assert!(space
            .handle_fault(&PageFault::new(base, FaultAccess::Write, true))
            .is_resolved());
        space.unmap(base).unwrap();
        stop.store(true, Ordering::Release);
    });

    let flushes = ctx.platform().flushes.lock().unwrap();
    assert!(flushes.contains(&(0, base.as_u64(), 1)));
    assert!(flushes.contains(&(1, base.as_u64(), 1)));
    drop(flushes);

    space.mark_inactive(0);
    space.mark_inactive(1);
}

#[test]
fn inactive_cores_are_left_alone() {
    let mut ram = Ram::new(64);
    let ctx = boot(&mut ram, 1_000);
    let space = VmSpace::new_user(&ctx).unwrap();
    space.mark_active(0);

    let base = space.alloc_user_pages(1, RW_USER, true).unwrap();
    space.unmap(base).unwrap();
    assert!(ctx.platform().flushes.lock().unwrap().iter().all(|f| f.0 == 0));
    space.mark_inactive(0);
}

#[test]
fn unacknowledged_shootdown_leaks_the_frame() {
    let mut ram = Ram::new(64);
    let ctx = boot(&mut ram, 1_000);
    let space = VmSpace::new_user(&ctx).unwrap();
    let base = space.alloc_user_pages(1, RW_USER, true).unwrap();
    let before = ctx.free_frames();

    space.mark_active(1);
    assert_eq!(
        space.unmap(base),
        Err(VmmError::Shootdown(ShootdownError::Timeout { cpu: 1 }))
    );
    assert!(space.translate(base).is_none());
    // neither the data frame nor the reclaimed tables come back
    assert_eq!(ctx.free_frames(), before);
    space.mark_inactive(1);

    // the range itself is reusable
    assert_eq!(space.alloc_user_pages(1, RW_USER, true).unwrap(), base);
}
