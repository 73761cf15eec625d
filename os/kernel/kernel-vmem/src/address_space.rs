//! # Address Space (x86-64, PML4-rooted)
//!
//! [`AddressSpace`] edits one tree of page tables rooted at a PML4 frame:
//!
//! - [`map`](AddressSpace::map) installs or updates a 4 KiB or 2 MiB
//!   translation, allocating intermediate tables on demand and splitting a
//!   covering 2 MiB leaf when allowed.
//! - [`unmap`](AddressSpace::unmap) removes a translation and can hand empty
//!   intermediate tables back to the frame source.
//! - [`translate`](AddressSpace::translate) / [`virt_to_phys`](AddressSpace::virt_to_phys)
//!   walk the tree read-only.
//!
//! Every successful edit is followed by an invalidation through the caller's
//! [`TlbInvalidate`], which decides whether other cores are involved.
//!
//! ## Safety
//!
//! The [`PhysMapper`] must yield writable views of table frames, and the
//! caller serializes edits of one tree (the owning space holds a lock).

use crate::entry::{PageFlags, PageTableEntry};
use crate::table::{ENTRIES, KERNEL_HALF_START, Level, PageTable};
use crate::tlb::{ShootdownError, TlbInvalidate};
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use log::{trace, warn};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// Error returned by [`AddressSpace::map`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory for an intermediate page table")]
    OutOfMemory,
    #[error("{virt} -> {phys} is not aligned to the requested page size")]
    Unaligned {
        virt: VirtualAddress,
        phys: PhysicalAddress,
    },
    #[error("{virt} is covered by a mapping of another page size")]
    SizeConflict { virt: VirtualAddress },
    /// The translation is installed but a remote core may still cache the
    /// previous one.
    #[error(transparent)]
    Shootdown(#[from] ShootdownError),
}

/// Error returned by [`AddressSpace::unmap`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnmapError {
    #[error("{virt} is not mapped")]
    NotMapped { virt: VirtualAddress },
    #[error("{virt} is mapped with a different page size")]
    SizeMismatch { virt: VirtualAddress },
    /// The translation is gone locally but a remote core did not confirm the
    /// flush, so `phys` must not be reused yet.
    #[error("unmapped {phys}, but: {source}")]
    Shootdown {
        phys: PhysicalAddress,
        source: ShootdownError,
    },
}

/// Result of a successful [`AddressSpace::translate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Base of the leaf page (4 KiB, 2 MiB or 1 GiB aligned).
    pub frame: PhysicalAddress,
    /// The translated byte address.
    pub phys: PhysicalAddress,
    /// Leaf attributes; `HUGE` marks leaves above the PT level.
    pub flags: PageFlags,
}

/// Tables allocated by one `map` call, undone if the call fails.
#[derive(Default)]
struct Fresh {
    links: [Option<(PhysicalPage<Size4K>, usize, PhysicalPage<Size4K>)>; 3],
    len: usize,
}

impl Fresh {
    fn push(&mut self, parent: PhysicalPage<Size4K>, index: usize, table: PhysicalPage<Size4K>) {
        self.links[self.len] = Some((parent, index, table));
        self.len += 1;
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and clear a new, empty root.
    ///
    /// Returns `None` if the frame source is exhausted.
    pub fn new<A: FrameAlloc + ?Sized>(mapper: &'m M, frames: &mut A) -> Option<Self> {
        let root = frames.alloc_4k()?;
        mapper.table_mut(root).zero();
        Some(Self { root, mapper })
    }

    /// View an existing tree.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// CPL0 with paging enabled; CR3 must point at a valid PML4.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let root = unsafe { crate::arch::read_cr3() };
        Self::from_root(mapper, PhysicalPage::from_addr(root))
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The tree must map the executing code, stack and the direct map.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { crate::arch::write_cr3(self.root.base()) }
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// The mapper this space reaches its tables through.
    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    fn table(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTable {
        self.mapper.table_mut(page)
    }

    /// Install or update the translation `virt -> phys`.
    ///
    /// `flags` selects the page size: with [`PageFlags::HUGE`] a 2 MiB leaf is
    /// written into the page directory, otherwise a 4 KiB leaf into the page
    /// table. The leaf is always present. Existing translations at `virt` are
    /// overwritten.
    ///
    /// A 4 KiB mapping inside an existing 2 MiB leaf splits that leaf into 512
    /// entries with its attributes when `allow_split` is set, and fails with
    /// [`MapError::SizeConflict`] otherwise.
    ///
    /// # Errors
    /// Any error except [`MapError::Shootdown`] leaves the tree unchanged:
    /// intermediate tables allocated by this call are returned to `frames`.
    pub fn map<A, T>(
        &self,
        frames: &mut A,
        tlb: &T,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        allow_split: bool,
    ) -> Result<(), MapError>
    where
        A: FrameAlloc + ?Sized,
        T: TlbInvalidate + ?Sized,
    {
        let huge = flags.contains(PageFlags::HUGE);
        let aligned = if huge {
            virt.is_aligned::<Size2M>() && phys.is_aligned::<Size2M>()
        } else {
            virt.is_aligned::<Size4K>() && phys.is_aligned::<Size4K>()
        };
        if !aligned {
            return Err(MapError::Unaligned { virt, phys });
        }

        let user = flags.contains(PageFlags::USER);
        let leaf_level = if huge { Level::Pd } else { Level::Pt };
        let (mut flush_base, mut flush_pages) = if huge { (virt, 512) } else { (virt, 1) };

        let mut fresh = Fresh::default();
        let mut table_page = self.root;
        for level in Level::ALL {
            if level == leaf_level {
                break;
            }
            let table = self.table(table_page);
            let i = level.index(virt);
            let e = table.get(i);

            table_page = if let Some(next) = e.next_table() {
                if user && !e.user() {
                    table.set(i, e.with_user(true));
                }
                next
            } else if e.present() {
                // a huge leaf covers `virt`
                if level != Level::Pd || !allow_split {
                    self.rollback(frames, &fresh);
                    return Err(MapError::SizeConflict { virt });
                }
                let Some(pt) = frames.alloc_4k() else {
                    self.rollback(frames, &fresh);
                    return Err(MapError::OutOfMemory);
                };
                let split = self.table(pt);
                for k in 0..ENTRIES {
                    split.set(k, e.split_part(k as u64));
                }
                table.set(i, PageTableEntry::table(pt, user || e.user()));
                flush_base = virt.page::<Size2M>().base();
                flush_pages = 512;
                trace!("split 2M leaf at {flush_base}");
                pt
            } else {
                let Some(next) = frames.alloc_4k() else {
                    self.rollback(frames, &fresh);
                    return Err(MapError::OutOfMemory);
                };
                self.table(next).zero();
                table.set(i, PageTableEntry::table(next, user));
                fresh.push(table_page, i, next);
                next
            };
        }

        let table = self.table(table_page);
        let i = leaf_level.index(virt);
        if huge && table.get(i).is_table() {
            self.rollback(frames, &fresh);
            return Err(MapError::SizeConflict { virt });
        }
        table.set(i, PageTableEntry::leaf(phys, flags));
        trace!("map {virt} -> {phys} {flags:?}");

        tlb.invalidate(flush_base, flush_pages)?;
        Ok(())
    }

    /// Free the tables a failed `map` allocated, deepest first.
    fn rollback<A: FrameAlloc + ?Sized>(&self, frames: &mut A, fresh: &Fresh) {
        for (parent, index, table) in fresh.links[..fresh.len].iter().rev().flatten() {
            self.table(*parent).set(*index, PageTableEntry::zero());
            frames.free_4k(*table);
        }
    }

    /// Remove the translation at `virt` and return the physical base it
    /// pointed to.
    ///
    /// `is_huge` states the size of the expected leaf. With `reclaim_tables`,
    /// intermediate tables left empty are returned to `frames` (never the
    /// root).
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] / [`UnmapError::SizeMismatch`] leave the tree
    /// unchanged. On [`UnmapError::Shootdown`] the leaf is gone; reclaimed
    /// tables are kept allocated since a remote walk may still reach them.
    pub fn unmap<A, T>(
        &self,
        frames: &mut A,
        tlb: &T,
        virt: VirtualAddress,
        is_huge: bool,
        reclaim_tables: bool,
    ) -> Result<PhysicalAddress, UnmapError>
    where
        A: FrameAlloc + ?Sized,
        T: TlbInvalidate + ?Sized,
    {
        let leaf_level = if is_huge { Level::Pd } else { Level::Pt };
        let mut path = [(self.root, 0usize); 3];
        let mut depth = 0;
        let mut table_page = self.root;
        for level in Level::ALL {
            if level == leaf_level {
                break;
            }
            let i = level.index(virt);
            let e = self.table(table_page).get(i);
            path[depth] = (table_page, i);
            depth += 1;
            table_page = match e.next_table() {
                Some(next) => next,
                None if e.present() => return Err(UnmapError::SizeMismatch { virt }),
                None => return Err(UnmapError::NotMapped { virt }),
            };
        }

        let table = self.table(table_page);
        let i = leaf_level.index(virt);
        let e = table.get(i);
        if !e.present() {
            return Err(UnmapError::NotMapped { virt });
        }
        if is_huge && !e.huge() {
            return Err(UnmapError::SizeMismatch { virt });
        }
        table.set(i, PageTableEntry::zero());
        let (phys, base, pages) = if is_huge {
            let phys = PhysicalPage::<Size2M>::from_addr(e.physical_address()).base();
            (phys, virt.page::<Size2M>().base(), 512)
        } else {
            (e.physical_address(), virt.page::<Size4K>().base(), 1)
        };
        trace!("unmap {base} (was {phys})");

        let mut empty = [None; 3];
        if reclaim_tables {
            let mut current = table_page;
            for (slot, &(parent, index)) in empty.iter_mut().zip(path[..depth].iter().rev()) {
                if !self.table(current).is_empty() {
                    break;
                }
                self.table(parent).set(index, PageTableEntry::zero());
                *slot = Some(current);
                current = parent;
            }
        }

        if let Err(source) = tlb.invalidate(base, pages) {
            if empty.iter().any(Option::is_some) {
                warn!("keeping reclaimed page tables of {base} after failed shootdown");
            }
            return Err(UnmapError::Shootdown { phys, source });
        }
        for table in empty.into_iter().flatten() {
            trace!("reclaim table {table}");
            frames.free_4k(table);
        }
        Ok(phys)
    }

    /// Translate `virt` to its physical address, if mapped.
    #[must_use]
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(virt).map(|t| t.phys)
    }

    /// Walk the tree for `virt`, returning the leaf's address and attributes.
    ///
    /// Handles 2 MiB and 1 GiB leaves by adding the in-page offset.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<Translation> {
        let mut table_page = self.root;
        for level in Level::ALL {
            let e = self.table(table_page).get(level.index(virt));
            if !e.present() {
                return None;
            }
            if level == Level::Pt || (level != Level::Pml4 && e.huge()) {
                let mask = level.entry_span() - 1;
                let frame = e.physical_address().as_u64() & !mask;
                let mut flags = e.flags();
                flags.set(PageFlags::HUGE, level != Level::Pt);
                return Some(Translation {
                    frame: PhysicalAddress::new(frame),
                    phys: PhysicalAddress::new(frame | (virt.as_u64() & mask)),
                    flags,
                });
            }
            table_page = PhysicalPage::from_addr(e.physical_address());
        }
        None
    }

    /// Copy the kernel-half root entries of `kernel` into this root, so both
    /// trees share the kernel's lower-level tables.
    pub fn share_kernel_half(&self, kernel: &AddressSpace<'_, M>) {
        let src = kernel.table(kernel.root);
        let dst = self.table(self.root);
        for i in KERNEL_HALF_START..ENTRIES {
            dst.set(i, src.get(i));
        }
    }

    /// Point every root entry covering `[base, base + size)` at a PDPT.
    ///
    /// Spaces that copied the kernel half earlier keep seeing mappings made
    /// later below these entries, since the root entries themselves never
    /// change again.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`]; tables installed before the failure stay.
    pub fn populate_root<A: FrameAlloc + ?Sized>(
        &self,
        frames: &mut A,
        base: VirtualAddress,
        size: u64,
    ) -> Result<(), MapError> {
        if size == 0 {
            return Ok(());
        }
        let root = self.table(self.root);
        let first = Level::Pml4.index(base);
        let last = Level::Pml4.index(base + (size - 1));
        for i in first..=last {
            if root.get(i).present() {
                continue;
            }
            let pdpt = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
            self.table(pdpt).zero();
            root.set(i, PageTableEntry::table(pdpt, false));
            trace!("root entry {i} -> {pdpt}");
        }
        Ok(())
    }

    /// Free every intermediate table of the user half and clear the root's
    /// user entries. Leaf frames are not touched; their owner releases them.
    pub fn destroy_lower_half<A: FrameAlloc + ?Sized>(&self, frames: &mut A) {
        let root = self.table(self.root);
        for i in 0..KERNEL_HALF_START {
            if let Some(pdpt) = root.get(i).next_table() {
                self.free_tables(frames, pdpt, Level::Pdpt);
            }
            root.set(i, PageTableEntry::zero());
        }
    }

    fn free_tables<A: FrameAlloc + ?Sized>(
        &self,
        frames: &mut A,
        page: PhysicalPage<Size4K>,
        level: Level,
    ) {
        if level != Level::Pt
            && let Some(below) = level.next()
        {
            for (_, e) in self.table(page).iter() {
                if let Some(child) = e.next_table() {
                    self.free_tables(frames, child, below);
                }
            }
        }
        frames.free_4k(page);
    }
}
