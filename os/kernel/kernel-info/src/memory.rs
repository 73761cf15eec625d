//! # Memory Layout

use kernel_memory_addresses::VirtualAddress;

/// Size of the base page and of one physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0x0000_7fff_ffff_f000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel's virtual arena (kernel stacks, control structures).
pub const KERNEL_ARENA_BASE: u64 = 0xffff_c900_0000_0000;

/// Size of the kernel's virtual arena (1 TiB).
pub const KERNEL_ARENA_SIZE: u64 = 1 << 40;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First address handed out by a process' low arena.
///
/// The first 4 MiB stay unmapped to catch null-pointer dereferences.
pub const USER_LOW_BASE: u64 = 0x0000_0000_0040_0000;

/// Boundary between a process' low and high arenas.
pub const USER_HIGH_BASE: u64 = 0x0000_4000_0000_0000;

/// Exclusive end of a process' high arena.
pub const USER_HIGH_END: u64 = LAST_USERSPACE_ADDRESS;

/// Highest buddy order: blocks of up to `2^BUDDY_MAX_ORDER` frames (4 MiB).
pub const BUDDY_MAX_ORDER: usize = 10;

/// Number of cores the TLB shootdown mailbox can address.
pub const MAX_CPUS: usize = 64;

/// Spin iterations an initiator waits for a remote TLB acknowledgment
/// before cancelling the request.
pub const SHOOTDOWN_SPIN_BUDGET: u64 = 1 << 22;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(USER_LOW_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_HIGH_BASE > USER_LOW_BASE);
    assert!(USER_HIGH_END > USER_HIGH_BASE);
    assert!(HHDM_BASE > LAST_USERSPACE_ADDRESS);
    assert!(KERNEL_ARENA_BASE > HHDM_BASE);
    assert!(KERNEL_ARENA_BASE + KERNEL_ARENA_SIZE <= KERNEL_BASE);
    assert!(MAX_CPUS <= 64);
};

/// A half-open range of virtual addresses managed by one arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ArenaRange {
    pub base: VirtualAddress,
    pub size: u64,
}

impl ArenaRange {
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base: VirtualAddress::new(base),
            size,
        }
    }

    /// Exclusive end of the range.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }
}

/// Runtime view of the memory layout.
///
/// [`Default`] reproduces the compile-time constants of this module; tests and
/// bring-up code may substitute smaller arenas.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Arena quantum; every arena hands out multiples of this.
    pub quantum: u64,
    /// Offset of the direct map used to touch physical memory.
    pub hhdm_base: u64,
    /// Kernel arena.
    pub kernel: ArenaRange,
    /// Per-process low arena.
    pub user_low: ArenaRange,
    /// Per-process high arena.
    pub user_high: ArenaRange,
    /// Spin budget for remote TLB acknowledgments.
    pub shootdown_budget: u64,
}

impl MemoryLayout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            quantum: PAGE_SIZE,
            hhdm_base: HHDM_BASE,
            kernel: ArenaRange::new(KERNEL_ARENA_BASE, KERNEL_ARENA_SIZE),
            user_low: ArenaRange::new(USER_LOW_BASE, USER_HIGH_BASE - USER_LOW_BASE),
            user_high: ArenaRange::new(USER_HIGH_BASE, USER_HIGH_END - USER_HIGH_BASE),
            shootdown_budget: SHOOTDOWN_SPIN_BUDGET,
        }
    }

    /// Whether `va` falls into one of the user arenas.
    #[must_use]
    pub const fn is_user(&self, va: VirtualAddress) -> bool {
        let v = va.as_u64();
        v >= self.user_low.base.as_u64() && v < self.user_high.end().as_u64()
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::new()
    }
}
