//! # Page-Table Entries
//!
//! One 64-bit entry format serves all four levels. Whether an entry is a leaf
//! depends on the level it sits in and, at the directory level, on the `huge`
//! (`PS`) bit:
//!
//! | Level | `huge = 0` | `huge = 1` |
//! |-------|------------|------------|
//! | PML4  | next table | reserved   |
//! | PDPT  | next table | 1 GiB leaf (never installed here) |
//! | PD    | next table | 2 MiB leaf |
//! | PT    | 4 KiB leaf | `PAT` bit, always written as 0 |
//!
//! Non-leaf entries are always installed `present | writable` (plus `user`
//! when any leaf below is user-accessible), so the leaf alone decides the
//! effective permissions.

use bitflags::bitflags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Raw x86-64 paging entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0).
    pub present: bool,
    /// **Writable** (bit 1).
    pub writable: bool,
    /// **User/Supervisor** (bit 2): user-mode access if set.
    pub user: bool,
    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,
    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,
    /// **Accessed** (bit 5): set by the CPU.
    pub accessed: bool,
    /// **Dirty** (bit 6): set by the CPU on write, leaf only.
    pub dirty: bool,
    /// **Page Size** (PS, bit 7): leaf at the PD/PDPT level.
    pub huge: bool,
    /// **Global** (bit 8): survives CR3 reloads, leaf only.
    pub global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_low: u8,
    /// Physical base (bits 12..51), 4 KiB granular.
    #[bits(40)]
    phys_51_12: u64,
    /// OS-available (bits 52..58).
    #[bits(7)]
    pub os_high: u8,
    /// Protection key (bits 59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// **No-Execute** (bit 63).
    pub no_execute: bool,
}

bitflags! {
    /// Caller-facing mapping attributes for [`AddressSpace::map`](crate::AddressSpace::map).
    ///
    /// `EXECUTABLE` is the inverse of the hardware NX bit; `HUGE` selects a
    /// 2 MiB leaf at the page-directory level.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const EXECUTABLE    = 1 << 2;
        const USER          = 1 << 3;
        const HUGE          = 1 << 4;
        const WRITE_THROUGH = 1 << 5;
        const CACHE_DISABLE = 1 << 6;
        const GLOBAL        = 1 << 7;
    }
}

impl PageTableEntry {
    /// The empty (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Physical base stored in the entry.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_51_12() << 12)
    }

    /// Set the physical base (must be 4 KiB aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_aligned::<Size4K>());
        self.set_phys_51_12(pa.as_u64() >> 12);
    }

    /// Link to a next-level table.
    #[must_use]
    pub const fn table(frame: PhysicalPage<Size4K>, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user);
        e.set_physical_address(frame.base());
        e
    }

    /// Leaf entry for `pa` with the given attributes.
    ///
    /// `PRESENT` is implied; `HUGE` sets `PS` and is only meaningful at the
    /// page-directory level.
    #[must_use]
    pub fn leaf(pa: PhysicalAddress, flags: PageFlags) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user(flags.contains(PageFlags::USER))
            .with_write_through(flags.contains(PageFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(PageFlags::CACHE_DISABLE))
            .with_huge(flags.contains(PageFlags::HUGE))
            .with_global(flags.contains(PageFlags::GLOBAL))
            .with_no_execute(!flags.contains(PageFlags::EXECUTABLE));
        e.set_physical_address(pa);
        e
    }

    /// Points to a lower-level table (present, not a huge leaf).
    ///
    /// Only meaningful above the PT level.
    #[inline]
    #[must_use]
    pub const fn is_table(self) -> bool {
        self.present() && !self.huge()
    }

    /// Next-level table frame, if this entry links one.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_table() {
            Some(PhysicalPage::from_addr(self.physical_address()))
        } else {
            None
        }
    }

    /// Decode the caller-facing attributes of a leaf.
    #[must_use]
    pub fn flags(self) -> PageFlags {
        let mut f = PageFlags::empty();
        f.set(PageFlags::PRESENT, self.present());
        f.set(PageFlags::WRITABLE, self.writable());
        f.set(PageFlags::EXECUTABLE, !self.no_execute());
        f.set(PageFlags::USER, self.user());
        f.set(PageFlags::HUGE, self.huge());
        f.set(PageFlags::WRITE_THROUGH, self.write_through());
        f.set(PageFlags::CACHE_DISABLE, self.cache_disable());
        f.set(PageFlags::GLOBAL, self.global());
        f
    }

    /// The 4 KiB entry that maps page `i` of this 2 MiB leaf after a split.
    ///
    /// Keeps every attribute except `PS`, which is the `PAT` bit at the PT
    /// level.
    #[must_use]
    pub const fn split_part(self, i: u64) -> Self {
        let mut e = self.with_huge(false);
        e.set_physical_address(PhysicalAddress::new(
            self.physical_address().as_u64() + i * 4096,
        ));
        e
    }
}
