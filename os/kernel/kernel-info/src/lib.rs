//! # Kernel Memory Configuration
//!
//! This crate is the single source of truth for the virtual memory layout and
//! the tunables of the memory-management core. Everything that has to agree
//! between the frame allocator, the arena allocators, the page-table mapper and
//! the per-process address spaces lives here.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Null guard (never mapped)     │
//! USER_LOW_BASE         ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │   User low arena                │
//!                       │   (images, heap, mmap)          │
//! USER_HIGH_BASE        ├─────────────────────────────────┤ 0x0000_4000_0000_0000
//!                       │   User high arena (stacks)      │
//! USER_HIGH_END         ├─────────────────────────────────┤ 0x0000_7fff_ffff_f000
//!                       │   Non-canonical hole            │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Map        │
//! KERNEL_ARENA_BASE     ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   Kernel arena (stacks, heaps)  │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel text & data            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The constants are consumed through [`memory::MemoryLayout`], which the
//! boot code may override (e.g. to shrink arenas in tests).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
