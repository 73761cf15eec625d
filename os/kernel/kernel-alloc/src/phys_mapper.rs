//! # Offset-based PhysMapper
//!
//! Physical memory is reached through a linear window: physical address `pa`
//! is visible at virtual address `offset + pa`. In the kernel the window is
//! the higher-half direct map ([`OffsetPhysMapper::hhdm`]); host tests point
//! it at a heap buffer that stands in for RAM.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::OffsetPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mapper = OffsetPhysMapper::hhdm();
//! assert_eq!(
//!     mapper.virt_of(PhysicalAddress::new(0x1000)).as_u64(),
//!     0xffff_8880_0000_1000,
//! );
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] adding a constant offset to every physical address.
///
/// # Safety
/// Whoever constructs the mapper vouches that `offset + pa` is mapped and
/// writable for every physical address it is later asked to touch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    /// Mapper over an arbitrary window; the sum wraps, so host tests may use
    /// `buffer - physical_base`.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's higher-half direct map.
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE)
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual address through which `pa` is visible.
    #[must_use]
    pub const fn virt_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.virt_of(pa).as_u64() as *mut T;
        // SAFETY: the caller guarantees `pa` is reachable through this window.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{PhysicalPage, Size4K};

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    const PHYS_BASE: u64 = 0x20_0000;

    fn ram(frames: usize) -> (Vec<Frame>, OffsetPhysMapper) {
        let mut buf: Vec<Frame> = (0..frames).map(|_| Frame([0xAA; 4096])).collect();
        let offset = (buf.as_mut_ptr() as u64).wrapping_sub(PHYS_BASE);
        (buf, OffsetPhysMapper::new(offset))
    }

    #[test]
    fn hhdm_window() {
        let m = OffsetPhysMapper::hhdm();
        assert_eq!(m.offset(), HHDM_BASE);
        assert_eq!(m.virt_of(PhysicalAddress::zero()).as_u64(), HHDM_BASE);
    }

    #[test]
    fn writes_land_in_the_backing_buffer() {
        let (buf, m) = ram(2);
        let word: &mut u64 = unsafe { m.phys_to_mut(PhysicalAddress::new(PHYS_BASE + 4096 + 8)) };
        *word = 0x1122_3344_5566_7788;
        assert_eq!(buf[1].0[8], 0x88);
        assert_eq!(buf[1].0[15], 0x11);
    }

    #[test]
    fn zero_and_copy_frames() {
        let (buf, m) = ram(2);
        let a = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(PHYS_BASE));
        let b = a.offset_pages(1);

        m.zero_frame(a);
        assert!(buf[0].0.iter().all(|&x| x == 0));

        m.copy_frame(b, a);
        assert!(buf[0].0.iter().all(|&x| x == 0xAA));
    }

    #[test]
    fn tables_are_reachable() {
        let (_buf, m) = ram(1);
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(PHYS_BASE));
        let table = m.table_mut(page);
        table.zero();
        assert!(table.is_empty());
    }
}
