//! # Virtual Memory Support
//!
//! The page-table mapping layer of the memory-management core: x86-64
//! four-level tables, a mapper that installs, splits and removes
//! translations, and the TLB invalidation that follows every edit.
//!
//! ## What you get
//! - [`AddressSpace`]: `map`/`unmap`/`translate` on one PML4-rooted tree.
//! - [`PageTableEntry`] and [`PageFlags`]: the raw entry and the
//!   caller-facing attributes.
//! - [`FrameAlloc`] / [`PhysMapper`]: where table frames come from and how
//!   physical memory is reached.
//! - [`tlb`]: local invalidation and the cross-core shootdown mailbox.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE  → maps 4 KiB page
//!   │        │        └────────────► PDE  → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (1 GiB leaves are only read, never created)
//!   └──────────────────────────────► PML4E
//! ```
//!
//! The upper 256 root entries form the kernel half, shared by every user
//! address space; the lower 256 are private to each space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod arch;
mod entry;
mod table;
pub mod tlb;

pub use crate::address_space::{AddressSpace, MapError, Translation, UnmapError};
pub use crate::entry::{PageFlags, PageTableEntry};
pub use crate::table::{ENTRIES, KERNEL_HALF_START, Level, PageTable};
pub use crate::tlb::{
    AtomicCpuMask, CpuId, CpuMask, LocalTlb, Shootdown, ShootdownError, ShootdownMailbox,
    TlbInvalidate, TlbPlatform,
};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames **must** be 4 KiB aligned. `None` means out of memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }
}

/// Converts physical addresses to usable references in the current virtual
/// address space (identity map, or the higher-half direct map in the kernel).
pub trait PhysMapper {
    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for `'a`.
    /// - `T` must match the bytes at `pa`, and no other reference to them may
    ///   be alive.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the page table stored in `page`.
    #[inline]
    fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: table frames are 4 KiB aligned and owned by the tree being edited.
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Fill `frame` with zeros.
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        // SAFETY: `frame` is a whole frame owned by the caller.
        let bytes = unsafe { self.phys_to_mut::<[u8; 4096]>(frame.base()) };
        bytes.fill(0);
    }

    /// Copy the contents of frame `from` into frame `to`.
    fn copy_frame(&self, from: PhysicalPage<Size4K>, to: PhysicalPage<Size4K>) {
        debug_assert_ne!(from, to);
        // SAFETY: distinct whole frames; `from` is only read.
        let src: &[u8; 4096] = unsafe { self.phys_to_mut(from.base()) };
        let dst: &mut [u8; 4096] = unsafe { self.phys_to_mut(to.base()) };
        dst.copy_from_slice(src);
    }
}
