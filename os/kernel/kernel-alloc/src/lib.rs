//! # Kernel Memory Allocators
//!
//! The two resource allocators of the memory-management core and the window
//! through which physical memory is touched.
//!
//! ```text
//!   Arena (virtual ranges)          FrameAllocator (physical frames)
//!   ┌──────────────────────┐        ┌──────────────────────────────┐
//!   │ span │ alloc │ free  │        │ order 0 ⇄ … ⇄ order 10       │
//!   └──────────┬───────────┘        └──────────────┬───────────────┘
//!              │   VA                              │   PA
//!              └──────────────► map ◄──────────────┘
//!                         (kernel-vmem)
//! ```
//!
//! - [`frame_alloc`]: buddy allocator over registered physical regions, with
//!   per-frame reference counts for copy-on-write sharing.
//! - [`arena`]: vmem-style allocator over virtual address ranges with
//!   instant-fit, best-fit and next-fit placement.
//! - [`phys_mapper`]: [`kernel_vmem::PhysMapper`] over a linear offset window.
//!
//! Neither allocator locks internally; the owner wraps each instance in a
//! `kernel_sync` mutex.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arena;
pub mod frame_alloc;
pub mod phys_mapper;

pub use arena::{Arena, ArenaCorruption, SegmentInfo, SegmentKind, Strategy, XallocConstraints};
pub use frame_alloc::{FrameAllocator, Region};
pub use phys_mapper::OffsetPhysMapper;
