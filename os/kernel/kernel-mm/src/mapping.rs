//! # Mapping Registry
//!
//! Records which virtual ranges of an address space are valid and how they
//! may be accessed, independent of whether page-table entries exist for them
//! yet. The fault resolver consults it to decide what a fault means.
//!
//! Mappings are kept in a [`BTreeMap`] keyed by base address; the mapping
//! containing an address is the last one starting at or below it.

use alloc::collections::BTreeMap;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageFlags;
use log::trace;

bitflags::bitflags! {
    /// Access rights and population policy of a [`Mapping`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MappingFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from ring 3.
        const USER = 1 << 3;
        /// Frames are shared; the first write takes a private copy.
        const COPY_ON_WRITE = 1 << 4;
        /// Frames are allocated by the first access, not up front.
        const ON_DEMAND = 1 << 5;
        /// Freshly allocated frames are cleared.
        const ZERO_FILL = 1 << 6;
    }
}

impl MappingFlags {
    /// Leaf flags for a page of this mapping.
    ///
    /// `private` pages are owned by this mapping alone and may be writable
    /// even under copy-on-write; shared pages never are.
    #[must_use]
    pub fn page_flags(self, private: bool) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        let writable =
            self.contains(Self::WRITE) && (private || !self.contains(Self::COPY_ON_WRITE));
        flags.set(PageFlags::WRITABLE, writable);
        flags.set(PageFlags::EXECUTABLE, self.contains(Self::EXECUTE));
        flags.set(PageFlags::USER, self.contains(Self::USER));
        flags
    }
}

/// A registered range `[base, base + size)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub base: VirtualAddress,
    pub size: u64,
    pub flags: MappingFlags,
}

impl Mapping {
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() - self.base.as_u64() < self.size
    }

    /// Whether `[base, base + size)` intersects this mapping.
    #[must_use]
    pub const fn overlaps(&self, base: VirtualAddress, size: u64) -> bool {
        base.as_u64() < self.end().as_u64() && self.base.as_u64() < base.as_u64() + size
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("mapping {base}+{size:#x} overlaps the mapping at {existing}")]
    Overlap {
        base: VirtualAddress,
        size: u64,
        existing: VirtualAddress,
    },
    #[error("mapping {base}+{size:#x} is empty or wraps around")]
    InvalidRange { base: VirtualAddress, size: u64 },
    #[error("no mapping starts at {base}")]
    NotFound { base: VirtualAddress },
}

/// The set of valid ranges of one address space.
#[derive(Debug, Default, Clone)]
pub struct MappingRegistry {
    map: BTreeMap<u64, Mapping>,
}

impl MappingRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Register `[base, base + size)`.
    ///
    /// An overlap is reported rather than treated as fatal: the registry is
    /// the arbiter for user-chosen addresses (`map_fixed`, `fork`), so the
    /// caller turns it into an error for the requester. The registry is left
    /// unchanged.
    ///
    /// # Errors
    /// [`RegistryError::Overlap`] if any registered mapping intersects the
    /// range, [`RegistryError::InvalidRange`] for empty or wrapping ranges.
    pub fn insert(
        &mut self,
        base: VirtualAddress,
        size: u64,
        flags: MappingFlags,
    ) -> Result<(), RegistryError> {
        if size == 0 || base.as_u64().checked_add(size).is_none() {
            return Err(RegistryError::InvalidRange { base, size });
        }
        if let Some(existing) = self.find_range(base, size) {
            return Err(RegistryError::Overlap {
                base,
                size,
                existing: existing.base,
            });
        }
        self.map.insert(base.as_u64(), Mapping { base, size, flags });
        trace!("register {base}+{size:#x} {flags:?}");
        Ok(())
    }

    /// Remove the mapping starting exactly at `base`.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] if no mapping starts there.
    pub fn remove(&mut self, base: VirtualAddress) -> Result<Mapping, RegistryError> {
        let mapping = self
            .map
            .remove(&base.as_u64())
            .ok_or(RegistryError::NotFound { base })?;
        trace!("unregister {base}+{:#x}", mapping.size);
        Ok(mapping)
    }

    /// The mapping containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Mapping> {
        self.map
            .range(..=va.as_u64())
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(va))
    }

    /// The lowest mapping intersecting `[base, base + size)`.
    #[must_use]
    pub fn find_range(&self, base: VirtualAddress, size: u64) -> Option<&Mapping> {
        if size == 0 {
            return None;
        }
        if let Some(m) = self.find(base) {
            return Some(m);
        }
        let end = base.as_u64().saturating_add(size);
        self.map
            .range(base.as_u64()..end)
            .next()
            .map(|(_, m)| m)
    }

    /// Replace the flags of the mapping starting at `base`, returning the old ones.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] if no mapping starts there.
    pub fn update_flags(
        &mut self,
        base: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<MappingFlags, RegistryError> {
        let mapping = self
            .map
            .get_mut(&base.as_u64())
            .ok_or(RegistryError::NotFound { base })?;
        Ok(core::mem::replace(&mut mapping.flags, flags))
    }

    /// All mappings in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.map.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: MappingFlags = MappingFlags::READ.union(MappingFlags::WRITE);

    fn va(x: u64) -> VirtualAddress {
        VirtualAddress::new(x)
    }

    #[test]
    fn find_returns_the_containing_mapping() {
        let mut r = MappingRegistry::new();
        r.insert(va(0x1000), 0x3000, RW).unwrap();
        r.insert(va(0x8000), 0x1000, MappingFlags::READ).unwrap();

        assert_eq!(r.find(va(0x1000)).unwrap().base, va(0x1000));
        assert_eq!(r.find(va(0x3fff)).unwrap().base, va(0x1000));
        assert!(r.find(va(0x4000)).is_none());
        assert!(r.find(va(0x0fff)).is_none());
        assert_eq!(r.find(va(0x8800)).unwrap().flags, MappingFlags::READ);
    }

    #[test]
    fn overlapping_inserts_are_rejected() {
        let mut r = MappingRegistry::new();
        r.insert(va(0x4000), 0x4000, RW).unwrap();

        for (base, size) in [(0x3000, 0x2000), (0x5000, 0x1000), (0x7000, 0x4000), (0x2000, 0x8000)] {
            let err = r.insert(va(base), size, RW).unwrap_err();
            assert_eq!(
                err,
                RegistryError::Overlap {
                    base: va(base),
                    size,
                    existing: va(0x4000)
                }
            );
        }
        assert_eq!(r.len(), 1);
        // touching ranges are fine
        r.insert(va(0x3000), 0x1000, RW).unwrap();
        r.insert(va(0x8000), 0x1000, RW).unwrap();
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn empty_and_wrapping_ranges_are_invalid() {
        let mut r = MappingRegistry::new();
        assert!(matches!(
            r.insert(va(0x1000), 0, RW),
            Err(RegistryError::InvalidRange { .. })
        ));
        assert!(matches!(
            r.insert(va(u64::MAX - 0xfff), 0x2000, RW),
            Err(RegistryError::InvalidRange { .. })
        ));
        assert!(r.is_empty());
    }

    #[test]
    fn remove_needs_the_exact_base() {
        let mut r = MappingRegistry::new();
        r.insert(va(0x1000), 0x2000, RW).unwrap();
        assert_eq!(
            r.remove(va(0x2000)),
            Err(RegistryError::NotFound { base: va(0x2000) })
        );
        let m = r.remove(va(0x1000)).unwrap();
        assert_eq!(m.size, 0x2000);
        assert!(r.find(va(0x1000)).is_none());
    }

    #[test]
    fn find_range_reports_the_lowest_overlap() {
        let mut r = MappingRegistry::new();
        r.insert(va(0x2000), 0x1000, RW).unwrap();
        r.insert(va(0x5000), 0x1000, RW).unwrap();
        assert_eq!(r.find_range(va(0x1000), 0x8000).unwrap().base, va(0x2000));
        assert_eq!(r.find_range(va(0x3000), 0x3000).unwrap().base, va(0x5000));
        assert!(r.find_range(va(0x3000), 0x2000).is_none());
        assert!(r.find_range(va(0x2000), 0).is_none());
    }

    #[test]
    fn flags_can_be_updated_in_place() {
        let mut r = MappingRegistry::new();
        r.insert(va(0x1000), 0x1000, RW).unwrap();
        let old = r
            .update_flags(va(0x1000), RW | MappingFlags::COPY_ON_WRITE)
            .unwrap();
        assert_eq!(old, RW);
        assert!(r.find(va(0x1000)).unwrap().flags.contains(MappingFlags::COPY_ON_WRITE));
        assert!(r.update_flags(va(0x9000), RW).is_err());
    }

    #[test]
    fn iteration_is_address_ordered() {
        let mut r = MappingRegistry::new();
        for base in [0x9000, 0x1000, 0x5000] {
            r.insert(va(base), 0x1000, RW).unwrap();
        }
        let bases: Vec<_> = r.iter().map(|m| m.base.as_u64()).collect();
        assert_eq!(bases, vec![0x1000, 0x5000, 0x9000]);
    }

    #[test]
    fn page_flags_follow_the_mapping() {
        let cow = RW | MappingFlags::USER | MappingFlags::COPY_ON_WRITE;
        assert!(!cow.page_flags(false).contains(PageFlags::WRITABLE));
        assert!(cow.page_flags(true).contains(PageFlags::WRITABLE));
        assert!(cow.page_flags(false).contains(PageFlags::USER));

        let text = MappingFlags::READ | MappingFlags::EXECUTE;
        let flags = text.page_flags(true);
        assert!(flags.contains(PageFlags::EXECUTABLE));
        assert!(!flags.contains(PageFlags::WRITABLE));
        assert!(!flags.contains(PageFlags::USER));
    }
}
