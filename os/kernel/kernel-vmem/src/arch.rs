//! CR3, CR4 and `invlpg` access. Hosted builds have no MMU to talk to; there
//! the flush helpers compile to nothing (or, under test, record what they
//! would have done).

use kernel_memory_addresses::VirtualAddress;

/// Above this many pages a full flush is cheaper than `invlpg` per page.
const FULL_FLUSH_THRESHOLD: u64 = 64;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

    /// CR4.PGE: global pages enabled.
    const CR4_PGE: u64 = 1 << 7;

    #[inline]
    pub fn invlpg(va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    /// # Safety
    /// CPL0 with paging enabled.
    #[inline]
    pub unsafe fn read_cr3() -> PhysicalAddress {
        let v: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new(v & 0x000F_FFFF_FFFF_F000)
    }

    /// # Safety
    /// `root` must be a valid PML4 that maps the executing code and stack.
    #[inline]
    pub unsafe fn write_cr3(root: PhysicalAddress) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn read_cr4() -> u64 {
        let v: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) v, options(nomem, nostack, preserves_flags));
        }
        v
    }

    #[inline]
    fn write_cr4(v: u64) {
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) v, options(nostack, preserves_flags));
        }
    }

    /// Flush every translation, global ones included.
    ///
    /// Clearing CR4.PGE drops global entries; with PGE off a CR3 reload is
    /// needed instead.
    #[inline]
    pub fn flush_all() {
        let cr4 = read_cr4();
        if cr4 & CR4_PGE == 0 {
            unsafe { write_cr3(read_cr3()) }
            return;
        }
        write_cr4(cr4 & !CR4_PGE);
        write_cr4(cr4);
    }
}

#[cfg(all(not(all(target_arch = "x86_64", target_os = "none")), not(test)))]
mod imp {
    use kernel_memory_addresses::VirtualAddress;

    #[inline]
    pub const fn invlpg(_va: VirtualAddress) {}

    #[inline]
    pub const fn flush_all() {}
}

#[cfg(all(not(all(target_arch = "x86_64", target_os = "none")), test))]
mod imp {
    use kernel_memory_addresses::VirtualAddress;
    use std::cell::RefCell;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Flush {
        Page(u64),
        AllWithGlobals,
    }

    std::thread_local! {
        pub static FLUSHES: RefCell<Vec<Flush>> = const { RefCell::new(Vec::new()) };
    }

    pub fn invlpg(va: VirtualAddress) {
        FLUSHES.with(|f| f.borrow_mut().push(Flush::Page(va.as_u64())));
    }

    pub fn flush_all() {
        FLUSHES.with(|f| f.borrow_mut().push(Flush::AllWithGlobals));
    }
}

pub use imp::*;

/// Invalidate `pages` 4 KiB pages starting at `va` on the executing core,
/// global translations included.
pub fn flush_range(va: VirtualAddress, pages: u64) {
    if pages > FULL_FLUSH_THRESHOLD {
        flush_all();
        return;
    }
    for i in 0..pages {
        invlpg(va + i * 4096);
    }
}
