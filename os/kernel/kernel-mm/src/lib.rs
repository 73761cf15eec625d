//! # Kernel Memory Manager
//!
//! Ties the allocators of `kernel-alloc` and the page-table mapper of
//! `kernel-vmem` together into the memory services the rest of the kernel
//! uses:
//!
//! - [`MemoryContext`]: the boot-time singleton owning the frame allocator,
//!   the kernel arena and the kernel page tables; hands out kernel pages and
//!   DMA memory.
//! - [`VmSpace`]: one user address space with its low/high arenas and its
//!   [`MappingRegistry`]; the surface for `mmap`/`munmap`, the ELF loader,
//!   `fork` and the page-fault handler.
//! - [`fault`]: turns a page fault into a translation or an escalation.
//!
//! ## Lock order
//!
//! ```text
//! registry (per space)  ─►  arena (per arena)  ─►  frame allocator
//! ```
//!
//! The registry lock of a space also serializes every edit of its page
//! tables. Kernel page tables are edited under the frame allocator lock.
//!
//! A lock taken while another one is held is always acquired with
//! `lock_irq`, and so is every registry lock: a task never yields or gets
//! preempted while the fault path could be spinning on the same lock.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod context;
pub mod fault;
pub mod mapping;
mod process;

pub use crate::context::{MemoryContext, MemoryContextBuilder};
pub use crate::fault::{
    EscalationReason, FaultAccess, FaultOutcome, PageFault, PageFaultErrorCode, Resolution,
};
pub use crate::mapping::{Mapping, MappingFlags, MappingRegistry, RegistryError};
pub use crate::process::VmSpace;

use kernel_alloc::FrameAllocator;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, MapError, ShootdownError, UnmapError};

/// A frame source whose frames can be shared between address spaces.
pub trait SharedFrames: FrameAlloc {
    /// Take another reference on an allocated frame.
    fn share(&mut self, frame: PhysicalPage<Size4K>);

    /// Drop a reference; returns `true` if that freed the frame.
    fn release(&mut self, frame: PhysicalPage<Size4K>) -> bool;

    fn ref_count(&self, frame: PhysicalPage<Size4K>) -> u32;
}

impl SharedFrames for FrameAllocator {
    fn share(&mut self, frame: PhysicalPage<Size4K>) {
        Self::share(self, frame);
    }

    fn release(&mut self, frame: PhysicalPage<Size4K>) -> bool {
        Self::release(self, frame)
    }

    fn ref_count(&self, frame: PhysicalPage<Size4K>) -> u32 {
        Self::ref_count(self, frame)
    }
}

/// Byte length of `pages` pages, `None` if it does not fit the address space.
pub(crate) const fn pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(kernel_info::memory::PAGE_SIZE)
}

/// Errors of the memory services.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("out of virtual address space")]
    OutOfAddressSpace,
    #[error("request for zero pages")]
    EmptyRequest,
    #[error("{base} is not page aligned")]
    Unaligned { base: VirtualAddress },
    #[error("{base} is already in use")]
    AddressInUse { base: VirtualAddress },
    #[error("{base} lies outside the arenas of the address space")]
    OutOfRange { base: VirtualAddress },
    #[error(transparent)]
    Map(MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Shootdown(#[from] ShootdownError),
}

impl From<MapError> for VmmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::Shootdown(e) => Self::Shootdown(e),
            e => Self::Map(e),
        }
    }
}
