//! Per-process address spaces.

use crate::context::MemoryContext;
use crate::fault::{self, FaultOutcome, PageFault};
use crate::mapping::{Mapping, MappingFlags, MappingRegistry};
use crate::{SharedFrames, VmmError, pages_to_bytes};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{Arena, FrameAllocator, Strategy};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinMutex;
use kernel_vmem::{
    AddressSpace, AtomicCpuMask, CpuId, CpuMask, FrameAlloc, MapError, PhysMapper, Shootdown,
    ShootdownError, TlbPlatform, Translation, UnmapError,
};
use log::{debug, error, warn};

/// A user address space: page tables, arenas and the mapping registry.
///
/// The kernel half of the root is shared with the kernel tables of the
/// [`MemoryContext`]. Dropping the space unmaps every mapping, drops the
/// frame references it holds and frees its user-half tables and root; it
/// must no longer be active on any core by then.
pub struct VmSpace<'c, M: PhysMapper, P: TlbPlatform> {
    ctx: &'c MemoryContext<M, P>,
    root: PhysicalPage<Size4K>,
    refs: AtomicUsize,
    active: AtomicCpuMask,
    low: SpinMutex<Arena>,
    high: SpinMutex<Arena>,
    registry: SpinMutex<MappingRegistry>,
}

impl<'c, M: PhysMapper, P: TlbPlatform> VmSpace<'c, M, P> {
    /// Create an empty user space holding one reference.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the root.
    pub fn new_user(ctx: &'c MemoryContext<M, P>) -> Result<Self, VmmError> {
        let root = {
            let mut frames = ctx.frames().lock_blocking();
            AddressSpace::new(ctx.mapper(), &mut *frames)
                .ok_or(VmmError::OutOfMemory)?
                .root_page()
        };
        AddressSpace::from_root(ctx.mapper(), root).share_kernel_half(&ctx.kernel_space());

        let layout = ctx.layout();
        let low = Arena::new(
            "user-low",
            layout.user_low.base,
            layout.user_low.size,
            layout.quantum,
        );
        let high = Arena::new(
            "user-high",
            layout.user_high.base,
            layout.user_high.size,
            layout.quantum,
        );
        debug!("new address space, root {root}");

        Ok(Self {
            ctx,
            root,
            refs: AtomicUsize::new(1),
            active: AtomicCpuMask::new(CpuMask::empty()),
            low: SpinMutex::new(low),
            high: SpinMutex::new(high),
            registry: SpinMutex::new(MappingRegistry::new()),
        })
    }

    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    const fn space(&self) -> AddressSpace<'c, M> {
        AddressSpace::from_root(self.ctx.mapper(), self.root)
    }

    fn tlb(&self) -> Shootdown<'c, P> {
        self.ctx.tlb_for(self.active.load())
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; `true` means the last user is gone and the owner
    /// should drop the space.
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Record that `cpu` runs on these tables; it will receive shootdowns.
    pub fn mark_active(&self, cpu: CpuId) {
        self.active.insert(cpu);
    }

    pub fn mark_inactive(&self, cpu: CpuId) {
        self.active.remove(cpu);
    }

    pub fn active_cpus(&self) -> CpuMask {
        self.active.load()
    }

    /// Switch `cpu` (the executing core) to this space.
    ///
    /// # Safety
    /// The executing core must be `cpu`, and the previous space must be
    /// marked inactive by the caller.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn activate(&self, cpu: CpuId) {
        self.mark_active(cpu);
        unsafe { self.space().activate() }
    }

    /// Reserve `size` bytes of the low arena, populated by the first access
    /// with zeroed frames (`mmap(MAP_ANONYMOUS)`).
    ///
    /// # Errors
    /// [`VmmError::EmptyRequest`] or [`VmmError::OutOfAddressSpace`].
    pub fn map_anonymous(&self, size: u64, flags: MappingFlags) -> Result<VirtualAddress, VmmError> {
        let pages = size.div_ceil(PAGE_SIZE);
        let flags = flags | MappingFlags::ON_DEMAND | MappingFlags::ZERO_FILL;
        self.alloc_in(&self.low, pages, flags, false)
    }

    /// Allocate `pages` pages anywhere in the high arena (stacks, relocatable
    /// images). With `backed`, zeroed frames are installed right away;
    /// otherwise the pages fill on demand.
    ///
    /// # Errors
    /// [`VmmError::EmptyRequest`], [`VmmError::OutOfAddressSpace`] or
    /// [`VmmError::OutOfMemory`]; nothing stays allocated on failure.
    pub fn alloc_user_pages(
        &self,
        pages: usize,
        flags: MappingFlags,
        backed: bool,
    ) -> Result<VirtualAddress, VmmError> {
        self.alloc_in(&self.high, pages as u64, flags, backed)
    }

    /// Map `pages` pages at exactly `base` (non-relocatable ELF segments).
    ///
    /// # Errors
    /// [`VmmError::Unaligned`], [`VmmError::OutOfRange`] if `base` lies
    /// outside both user arenas, [`VmmError::AddressInUse`] if any page is
    /// taken, or [`VmmError::OutOfMemory`].
    pub fn map_fixed(
        &self,
        base: VirtualAddress,
        pages: usize,
        flags: MappingFlags,
        backed: bool,
    ) -> Result<(), VmmError> {
        if pages == 0 {
            return Err(VmmError::EmptyRequest);
        }
        if !base.is_aligned::<Size4K>() {
            return Err(VmmError::Unaligned { base });
        }
        let arena = self.arena_for(base).ok_or(VmmError::OutOfRange { base })?;
        let size = pages_to_bytes(pages as u64).ok_or(VmmError::OutOfRange { base })?;
        arena
            .lock_blocking()
            .claim(base, size)
            .ok_or(VmmError::AddressInUse { base })?;

        if let Err(e) = self.register(base, pages as u64, flags, backed) {
            arena.lock_blocking().free(base, size);
            return Err(e);
        }
        Ok(())
    }

    fn alloc_in(
        &self,
        arena: &SpinMutex<Arena>,
        pages: u64,
        flags: MappingFlags,
        backed: bool,
    ) -> Result<VirtualAddress, VmmError> {
        if pages == 0 {
            return Err(VmmError::EmptyRequest);
        }
        let size = pages_to_bytes(pages).ok_or(VmmError::OutOfAddressSpace)?;
        let base = arena
            .lock_blocking()
            .alloc(size, Strategy::InstantFit)
            .ok_or(VmmError::OutOfAddressSpace)?;

        if let Err(e) = self.register(base, pages, flags, backed) {
            arena.lock_blocking().free(base, size);
            return Err(e);
        }
        Ok(base)
    }

    /// Record the mapping and, if `backed`, install zeroed frames for it.
    fn register(
        &self,
        base: VirtualAddress,
        pages: u64,
        flags: MappingFlags,
        backed: bool,
    ) -> Result<(), VmmError> {
        let flags = if backed {
            flags
        } else {
            flags | MappingFlags::ON_DEMAND
        };
        let mut registry = self.registry.lock_irq();
        registry.insert(base, pages * PAGE_SIZE, flags)?;
        if backed && let Err(e) = self.populate(base, pages, flags) {
            if let Err(lost) = registry.remove(base) {
                warn!("rollback of {base}: {lost}");
            }
            return Err(e);
        }
        debug!("map {base} x{pages} {flags:?}");
        Ok(())
    }

    fn populate(&self, base: VirtualAddress, pages: u64, flags: MappingFlags) -> Result<(), VmmError> {
        let mut frames = self.ctx.frames().lock_irq();
        let space = self.space();
        let tlb = self.tlb();
        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            let result = match frames.alloc_4k() {
                None => Err(VmmError::OutOfMemory),
                Some(frame) => {
                    self.ctx.mapper().zero_frame(frame);
                    match space.map(&mut *frames, &tlb, va, frame.base(), flags.page_flags(true), false) {
                        Ok(()) | Err(MapError::Shootdown(_)) => Ok(()),
                        Err(e) => {
                            frames.release(frame);
                            Err(VmmError::from(e))
                        }
                    }
                }
            };
            if let Err(e) = result {
                warn!("populating {base} x{pages}: {e}, rolling back {i} pages");
                if let Err(lost) = unmap_pages(&space, &mut *frames, &tlb, base, i) {
                    warn!("rollback of {base} leaked frames: {lost}");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the mapping starting at `base` (`munmap`), dropping its frames.
    ///
    /// # Errors
    /// [`VmmError::Registry`] if no mapping starts at `base`;
    /// [`VmmError::Shootdown`] if a core did not confirm the invalidation,
    /// in which case the affected frames are leaked rather than reused.
    pub fn unmap(&self, base: VirtualAddress) -> Result<(), VmmError> {
        let (mapping, result) = {
            let mut registry = self.registry.lock_irq();
            let mapping = registry.remove(base)?;
            let mut frames = self.ctx.frames().lock_irq();
            let pages = mapping.size / PAGE_SIZE;
            let result = unmap_pages(&self.space(), &mut *frames, &self.tlb(), base, pages);
            (mapping, result)
        };
        if let Some(arena) = self.arena_for(base) {
            arena.lock_blocking().free(base, mapping.size);
        }
        debug!("unmap {base} x{}", mapping.size / PAGE_SIZE);
        result.map_err(VmmError::from)
    }

    /// Resolve a page fault raised while this space was active.
    pub fn handle_fault(&self, fault: &PageFault) -> FaultOutcome {
        let registry = self.registry.lock_irq();
        let mut frames = self.ctx.frames().lock_irq();
        fault::resolve(&self.space(), &registry, &mut *frames, &self.tlb(), fault)
    }

    /// Duplicate this space for `fork`: every mapping is shared with the
    /// child, writable ones copy-on-write in both spaces.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] or [`VmmError::Shootdown`]; the partial
    /// child is torn down again.
    pub fn fork_cow(&self) -> Result<Self, VmmError> {
        let child = Self::new_user(self.ctx)?;
        match self.share_into(&child) {
            Ok(()) => Ok(child),
            Err(e) => {
                warn!("fork of {} failed: {e}", self.root);
                drop(child);
                Err(e)
            }
        }
    }

    fn share_into(&self, child: &Self) -> Result<(), VmmError> {
        let mut registry = self.registry.lock_irq();
        let mut child_registry = child.registry.lock_irq();
        let mappings: Vec<Mapping> = registry.iter().copied().collect();

        for m in mappings {
            let shared = if m.flags.contains(MappingFlags::WRITE) {
                m.flags | MappingFlags::COPY_ON_WRITE
            } else {
                m.flags
            };
            let arena = child
                .arena_for(m.base)
                .ok_or(VmmError::OutOfRange { base: m.base })?;
            arena
                .lock_irq()
                .claim(m.base, m.size)
                .ok_or(VmmError::AddressInUse { base: m.base })?;
            if let Err(e) = child_registry.insert(m.base, m.size, shared) {
                arena.lock_irq().free(m.base, m.size);
                return Err(e.into());
            }

            // Downgrade the parent first so neither side can write a shared frame.
            if shared != m.flags {
                registry.update_flags(m.base, shared)?;
            }
            let mut frames = self.ctx.frames().lock_irq();
            self.share_pages(child, &mut frames, &m, shared)?;
        }
        debug!("forked {} into {}", self.root, child.root);
        Ok(())
    }

    fn share_pages(
        &self,
        child: &Self,
        frames: &mut FrameAllocator,
        m: &Mapping,
        shared: MappingFlags,
    ) -> Result<(), VmmError> {
        let (parent, parent_tlb) = (self.space(), self.tlb());
        let (copy, child_tlb) = (child.space(), child.tlb());
        let flags = shared.page_flags(false);
        for i in 0..m.size / PAGE_SIZE {
            let va = m.base + i * PAGE_SIZE;
            let Some(t) = parent.translate(va) else {
                continue;
            };
            let frame = PhysicalPage::<Size4K>::from_addr(t.frame);
            if t.flags != flags {
                parent.map(&mut *frames, &parent_tlb, va, t.frame, flags, false)?;
            }
            frames.share(frame);
            if let Err(e) = copy.map(&mut *frames, &child_tlb, va, t.frame, flags, false) {
                frames.release(frame);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Physical address behind `va`, used as a key for futexes shared across
    /// spaces.
    pub fn physical_key(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _registry = self.registry.lock_irq();
        self.space().virt_to_phys(va)
    }

    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let _registry = self.registry.lock_irq();
        self.space().translate(va)
    }

    /// Snapshot of the registered mappings in address order.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.registry.lock_irq().iter().copied().collect()
    }

    fn arena_for(&self, va: VirtualAddress) -> Option<&SpinMutex<Arena>> {
        let layout = self.ctx.layout();
        let within = |r: &kernel_info::memory::ArenaRange| va >= r.base && va < r.end();
        if within(&layout.user_low) {
            Some(&self.low)
        } else if within(&layout.user_high) {
            Some(&self.high)
        } else {
            None
        }
    }
}

impl<M: PhysMapper, P: TlbPlatform> Drop for VmSpace<'_, M, P> {
    fn drop(&mut self) {
        let refs = *self.refs.get_mut();
        if refs != 0 {
            warn!("dropping address space {} with {refs} references left", self.root);
        }
        let active = self.active.load();
        if !active.is_empty() {
            error!("dropping address space {} still active on {active:?}", self.root);
        }

        let registry = core::mem::take(self.registry.get_mut());
        let space = self.space();
        let tlb = self.tlb();
        let mut frames = self.ctx.frames().lock_blocking();
        for m in registry.iter() {
            if let Err(e) = unmap_pages(&space, &mut *frames, &tlb, m.base, m.size / PAGE_SIZE) {
                warn!("teardown of {} leaked frames of {}: {e}", self.root, m.base);
            }
        }
        space.destroy_lower_half(&mut *frames);
        frames.free(self.root, 1);
        debug!("destroyed address space {}", self.root);
    }
}

/// Unmap `pages` pages at `base`, dropping one reference on every frame
/// found. Pages never populated are skipped.
fn unmap_pages<M, A, T>(
    space: &AddressSpace<'_, M>,
    frames: &mut A,
    tlb: &T,
    base: VirtualAddress,
    pages: u64,
) -> Result<(), ShootdownError>
where
    M: PhysMapper,
    A: SharedFrames + ?Sized,
    T: kernel_vmem::TlbInvalidate + ?Sized,
{
    let mut result = Ok(());
    for i in 0..pages {
        let va = base + i * PAGE_SIZE;
        match space.unmap(frames, tlb, va, false, true) {
            Ok(pa) => {
                frames.release(PhysicalPage::from_addr(pa));
            }
            Err(UnmapError::NotMapped { .. }) => {}
            Err(UnmapError::Shootdown { phys, source }) => {
                warn!("leaking {phys} of {va}: {source}");
                result = Err(source);
            }
            Err(e @ UnmapError::SizeMismatch { .. }) => {
                error!("cannot unmap {va}: {e}");
            }
        }
    }
    result
}
