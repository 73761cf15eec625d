#![allow(dead_code)]

use kernel_alloc::OffsetPhysMapper;
use kernel_info::memory::{ArenaRange, KERNEL_ARENA_BASE, MemoryLayout, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_mm::{
    FaultAccess, FaultOutcome, MemoryContext, MemoryContextBuilder, PageFault, VmSpace,
};
use kernel_vmem::{CpuId, PageFlags, PhysMapper, TlbPlatform};

/// Physical base of the simulated RAM.
pub const RAM_BASE: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct RamFrame([u8; 4096]);

/// Heap memory standing in for physical RAM at [`RAM_BASE`].
pub struct Ram {
    frames: Vec<RamFrame>,
}

impl Ram {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames).map(|_| RamFrame([0x5A; 4096])).collect(),
        }
    }

    pub fn mapper(&mut self) -> OffsetPhysMapper {
        OffsetPhysMapper::new((self.frames.as_mut_ptr() as u64).wrapping_sub(RAM_BASE))
    }

    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }
}

/// A single core; remote shootdowns never happen.
pub struct Uniprocessor;

impl TlbPlatform for Uniprocessor {
    fn current_cpu(&self) -> CpuId {
        0
    }

    fn flush_local(&self, _va: VirtualAddress, _pages: u64) {}

    fn send_invalidate_ipi(&self, cpu: CpuId) {
        panic!("unexpected IPI to CPU {cpu}");
    }
}

pub type TestContext = MemoryContext<OffsetPhysMapper, Uniprocessor>;
pub type TestSpace<'c> = VmSpace<'c, OffsetPhysMapper, Uniprocessor>;

/// Small layout: 256 kernel arena pages, user low arena from `0x1000`.
pub fn layout() -> MemoryLayout {
    MemoryLayout {
        quantum: PAGE_SIZE,
        hhdm_base: 0,
        kernel: ArenaRange::new(KERNEL_ARENA_BASE, 256 * PAGE_SIZE),
        user_low: ArenaRange::new(0x1000, 0x40_0000 - 0x1000),
        user_high: ArenaRange::new(0x40_0000, 0x40_0000),
        shootdown_budget: 1 << 16,
    }
}

/// A booted context over `frames` frames of RAM. Field order keeps the RAM
/// alive until the context is gone.
pub struct Machine {
    pub ctx: TestContext,
    ram: Ram,
}

impl Machine {
    pub fn boot(frames: usize) -> Self {
        let mut ram = Ram::new(frames);
        let ctx = MemoryContextBuilder::new(layout())
            .add_region(PhysicalAddress::new(RAM_BASE), ram.size())
            .build(ram.mapper(), Uniprocessor)
            .unwrap();
        Self { ctx, ram }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn frame_bytes(&self, frame: PhysicalPage<Size4K>) -> &mut [u8; 4096] {
        unsafe { self.ctx.mapper().phys_to_mut(frame.base()) }
    }
}

/// Minimal MMU model: performs a user access through the page tables of
/// `space`, taking page faults the way the CPU would.
pub fn user_access(
    space: &TestSpace<'_>,
    va: VirtualAddress,
    access: FaultAccess,
) -> Result<PhysicalAddress, FaultOutcome> {
    let mut last = None;
    for _ in 0..2 {
        if let Some(t) = space.translate(va) {
            let allowed = t.flags.contains(PageFlags::USER)
                && (access != FaultAccess::Write || t.flags.contains(PageFlags::WRITABLE));
            if allowed {
                return Ok(t.phys);
            }
        }
        let outcome = space.handle_fault(&PageFault::new(va, access, true));
        if !outcome.is_resolved() {
            return Err(outcome);
        }
        last = Some(outcome);
    }
    Err(last.expect("second attempt after a resolved fault"))
}

pub fn write_byte(machine: &Machine, space: &TestSpace<'_>, va: VirtualAddress, value: u8) {
    let pa = user_access(space, va, FaultAccess::Write).unwrap();
    let frame = PhysicalPage::<Size4K>::from_addr(pa);
    machine.frame_bytes(frame)[(pa.as_u64() & 0xfff) as usize] = value;
}

pub fn read_byte(machine: &Machine, space: &TestSpace<'_>, va: VirtualAddress) -> u8 {
    let pa = user_access(space, va, FaultAccess::Read).unwrap();
    let frame = PhysicalPage::<Size4K>::from_addr(pa);
    machine.frame_bytes(frame)[(pa.as_u64() & 0xfff) as usize]
}
