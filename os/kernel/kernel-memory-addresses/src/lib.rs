//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases and in-page
//! offsets used throughout the memory-management core.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM / MMIO). |
//! | [`VirtualAddress`] | A byte address translated by the page tables. |
//! | [`PhysicalPage<S>`] | Page-aligned physical base of a page of size `S` (a frame for `S = Size4K`). |
//! | [`VirtualPage<S>`] | Page-aligned virtual base of a page of size `S`. |
//! | [`PageOffset<S>`] | The offset inside a page of size `S`. |
//!
//! Two page sizes exist, matching the two leaf levels the mapper installs:
//! [`Size4K`] and [`Size2M`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_4000_0020_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_4000_0020_1000);
//! assert_eq!(page.join(off), va);
//!
//! let huge = va.page::<Size2M>();
//! assert_eq!(huge.base().as_u64(), 0x0000_4000_0020_0000);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64`, `Copy`, ordered and
//! hashable, so they can key ordered maps directly.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use crate::page::{PageOffset, PhysicalPage, VirtualPage};
pub use crate::page_size::{PageSize, Size2M, Size4K};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Align `x` down to a multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to a multiple of `a` (`a` must be a power of two).
///
/// Returns `None` if the result does not fit in a `u64`.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
    }

    #[test]
    fn physical_split_and_join() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let (pp, off) = pa.split::<Size4K>();
        assert_eq!(pp.base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(off.as_u64(), 0x42);
        assert_eq!(pp.join(off), pa);
    }

    #[test]
    fn huge_page_contains_small_pages() {
        let va = VirtualAddress::new(0x0000_4000_0030_5000);
        let huge = va.page::<Size2M>();
        assert_eq!(huge.base().as_u64(), 0x0000_4000_0020_0000);
        assert_eq!(va.offset::<Size2M>().as_u64(), 0x10_5000);
        assert!(!va.is_aligned::<Size2M>());
        assert!(huge.base().is_aligned::<Size2M>());
    }

    #[test]
    fn frame_numbers_round_trip() {
        let page = PhysicalPage::<Size4K>::from_number(0x123);
        assert_eq!(page.base().as_u64(), 0x12_3000);
        assert_eq!(page.number(), 0x123);
        assert_eq!(page.offset_pages(2).number(), 0x125);
    }
}
