//! Boot-time construction and the kernel-wide memory services.

use crate::{VmmError, pages_to_bytes};
use kernel_alloc::{Arena, FrameAllocator, Strategy};
use kernel_info::memory::{MAX_CPUS, MemoryLayout, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinMutex;
use kernel_vmem::{
    AddressSpace, CpuId, CpuMask, FrameAlloc, MapError, PageFlags, PhysMapper, Shootdown,
    ShootdownMailbox, TlbPlatform, UnmapError,
};
use log::{debug, error, info, warn};

/// Collects the physical memory map before the kernel tables exist.
///
/// ```no_run
/// # use kernel_mm::MemoryContextBuilder;
/// # use kernel_info::memory::MemoryLayout;
/// # use kernel_memory_addresses::PhysicalAddress;
/// # fn boot<P: kernel_vmem::TlbPlatform>(platform: P) -> Result<(), kernel_mm::VmmError> {
/// let ctx = MemoryContextBuilder::new(MemoryLayout::default())
///     .add_region(PhysicalAddress::new(0x10_0000), 64 << 20)
///     .cpus(4)
///     .build(kernel_alloc::OffsetPhysMapper::hhdm(), platform)?;
/// let stack = ctx.alloc_kernel_pages(4)?;
/// # Ok(()) }
/// ```
pub struct MemoryContextBuilder {
    layout: MemoryLayout,
    frames: FrameAllocator,
    cpus: usize,
}

impl MemoryContextBuilder {
    #[must_use]
    pub const fn new(layout: MemoryLayout) -> Self {
        Self {
            layout,
            frames: FrameAllocator::new(),
            cpus: 1,
        }
    }

    /// Register usable RAM. Regions must come in increasing address order.
    #[must_use]
    pub fn add_region(mut self, base: PhysicalAddress, size: u64) -> Self {
        self.frames.add_region(base, size);
        self
    }

    /// Register RAM whose first `used_pages` frames are already occupied.
    #[must_use]
    pub fn add_region_reserved(mut self, base: PhysicalAddress, size: u64, used_pages: usize) -> Self {
        self.frames.add_region_reserved(base, size, used_pages);
        self
    }

    /// Number of cores that will come online.
    ///
    /// # Panics
    /// Outside `1..=MAX_CPUS`.
    #[must_use]
    pub fn cpus(mut self, cpus: usize) -> Self {
        assert!((1..=MAX_CPUS).contains(&cpus), "unsupported number of CPUs");
        self.cpus = cpus;
        self
    }

    /// Finish with a fresh, empty kernel root.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the registered regions cannot hold the
    /// root and the kernel arena's top-level tables.
    pub fn build<M: PhysMapper, P: TlbPlatform>(
        mut self,
        mapper: M,
        platform: P,
    ) -> Result<MemoryContext<M, P>, VmmError> {
        let root = AddressSpace::new(&mapper, &mut self.frames)
            .ok_or(VmmError::OutOfMemory)?
            .root_page();
        self.finish(mapper, platform, root)
    }

    /// Finish by adopting the tables the loader built (e.g. read from CR3).
    ///
    /// The frames of those tables must not lie in a registered region.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the kernel arena's top-level tables
    /// cannot be allocated.
    pub fn build_with_root<M: PhysMapper, P: TlbPlatform>(
        self,
        mapper: M,
        platform: P,
        root: PhysicalPage<Size4K>,
    ) -> Result<MemoryContext<M, P>, VmmError> {
        self.finish(mapper, platform, root)
    }

    fn finish<M: PhysMapper, P: TlbPlatform>(
        mut self,
        mapper: M,
        platform: P,
        root: PhysicalPage<Size4K>,
    ) -> Result<MemoryContext<M, P>, VmmError> {
        let layout = self.layout;
        AddressSpace::from_root(&mapper, root).populate_root(
            &mut self.frames,
            layout.kernel.base,
            layout.kernel.size,
        )?;

        let arena = Arena::new("kernel", layout.kernel.base, layout.kernel.size, layout.quantum);
        info!(
            "memory: {} of {} frames free, kernel arena {}..{}, {} CPUs",
            self.frames.free_frames(),
            self.frames.total_frames(),
            layout.kernel.base,
            layout.kernel.end(),
            self.cpus
        );

        Ok(MemoryContext {
            layout,
            mapper,
            platform,
            mailbox: ShootdownMailbox::new(),
            online: CpuMask::first(self.cpus),
            frames: SpinMutex::new(self.frames),
            kernel_arena: SpinMutex::new(arena),
            kernel_root: root,
        })
    }
}

/// Kernel-wide memory state, created once at boot.
pub struct MemoryContext<M: PhysMapper, P: TlbPlatform> {
    layout: MemoryLayout,
    mapper: M,
    platform: P,
    mailbox: ShootdownMailbox,
    online: CpuMask,
    frames: SpinMutex<FrameAllocator>,
    kernel_arena: SpinMutex<Arena>,
    kernel_root: PhysicalPage<Size4K>,
}

impl<M: PhysMapper, P: TlbPlatform> MemoryContext<M, P> {
    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub const fn mailbox(&self) -> &ShootdownMailbox {
        &self.mailbox
    }

    #[must_use]
    pub const fn online_cpus(&self) -> CpuMask {
        self.online
    }

    /// The frame allocator; lock it with `lock_blocking` from task context
    /// and `lock_irq` from interrupt context.
    #[must_use]
    pub const fn frames(&self) -> &SpinMutex<FrameAllocator> {
        &self.frames
    }

    #[must_use]
    pub const fn kernel_arena(&self) -> &SpinMutex<Arena> {
        &self.kernel_arena
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock_blocking().free_frames()
    }

    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, self.kernel_root)
    }

    /// Invalidation for kernel mappings, which are live on every core.
    #[must_use]
    pub const fn kernel_tlb(&self) -> Shootdown<'_, P> {
        self.tlb_for(self.online)
    }

    pub(crate) const fn tlb_for(&self, targets: CpuMask) -> Shootdown<'_, P> {
        Shootdown::new(
            &self.mailbox,
            &self.platform,
            targets,
            self.layout.shootdown_budget,
        )
    }

    /// Entry point of the TLB shootdown IPI handler on `cpu`.
    pub fn handle_shootdown_ipi(&self, cpu: CpuId) -> bool {
        self.mailbox.handle_ipi(cpu, &self.platform)
    }

    /// Allocate and map `pages` writable kernel pages.
    ///
    /// # Errors
    /// [`VmmError::EmptyRequest`], [`VmmError::OutOfAddressSpace`] or
    /// [`VmmError::OutOfMemory`]; nothing stays allocated on failure.
    pub fn alloc_kernel_pages(&self, pages: usize) -> Result<VirtualAddress, VmmError> {
        if pages == 0 {
            return Err(VmmError::EmptyRequest);
        }
        let size = pages_to_bytes(pages as u64).ok_or(VmmError::OutOfAddressSpace)?;
        let base = self
            .kernel_arena
            .lock_blocking()
            .alloc(size, Strategy::InstantFit)
            .ok_or(VmmError::OutOfAddressSpace)?;

        let backed = {
            let mut frames = self.frames.lock_blocking();
            self.back_kernel_pages(&mut frames, base, pages)
        };
        if let Err(e) = backed {
            self.kernel_arena.lock_blocking().free(base, size);
            return Err(e);
        }
        debug!("kernel pages {base} x{pages}");
        Ok(base)
    }

    fn back_kernel_pages(
        &self,
        frames: &mut FrameAllocator,
        base: VirtualAddress,
        pages: usize,
    ) -> Result<(), VmmError> {
        let space = self.kernel_space();
        let tlb = self.kernel_tlb();
        let flags = PageFlags::WRITABLE | PageFlags::GLOBAL;
        for i in 0..pages {
            let va = base + i as u64 * PAGE_SIZE;
            let result = match frames.alloc_4k() {
                None => Err(VmmError::OutOfMemory),
                Some(frame) => match space.map(frames, &tlb, va, frame.base(), flags, false) {
                    // Absent entries are never cached remotely.
                    Ok(()) | Err(MapError::Shootdown(_)) => Ok(()),
                    Err(e) => {
                        frames.release(frame);
                        Err(VmmError::from(e))
                    }
                },
            };
            if let Err(e) = result {
                warn!("kernel pages {base} x{pages}: {e}, rolling back {i} pages");
                if let Err(lost) = self.unmap_kernel_pages(frames, base, i) {
                    warn!("rollback of kernel pages {base}: {lost}");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap and free pages from [`alloc_kernel_pages`](Self::alloc_kernel_pages).
    ///
    /// # Errors
    /// [`VmmError::Shootdown`] if a core did not confirm the invalidation;
    /// the affected frames are leaked rather than reused.
    ///
    /// [`VmmError::OutOfRange`] if `pages` cannot describe an allocation.
    ///
    /// # Panics
    /// If `base`/`pages` do not describe one allocation.
    pub fn free_kernel_pages(&self, base: VirtualAddress, pages: usize) -> Result<(), VmmError> {
        if pages == 0 {
            return Ok(());
        }
        let size = pages_to_bytes(pages as u64).ok_or(VmmError::OutOfRange { base })?;
        let result = {
            let mut frames = self.frames.lock_blocking();
            self.unmap_kernel_pages(&mut frames, base, pages)
        };
        self.kernel_arena.lock_blocking().free(base, size);
        result
    }

    fn unmap_kernel_pages(
        &self,
        frames: &mut FrameAllocator,
        base: VirtualAddress,
        pages: usize,
    ) -> Result<(), VmmError> {
        let space = self.kernel_space();
        let tlb = self.kernel_tlb();
        let mut result = Ok(());
        for i in 0..pages {
            let va = base + i as u64 * PAGE_SIZE;
            // Kernel tables are shared by every space and never reclaimed.
            match space.unmap(frames, &tlb, va, false, false) {
                Ok(pa) => {
                    frames.release(PhysicalPage::from_addr(pa));
                }
                Err(UnmapError::Shootdown { phys, source }) => {
                    warn!("leaking {phys} of {va}: {source}");
                    result = Err(VmmError::Shootdown(source));
                }
                Err(e) => {
                    error!("kernel page {va} was not mapped: {e}");
                    result = Err(VmmError::Unmap(e));
                }
            }
        }
        result
    }

    /// Physically contiguous frames ending below `limit`, for device DMA.
    pub fn alloc_dma(&self, count: usize, limit: PhysicalAddress) -> Option<PhysicalPage<Size4K>> {
        let frame = self.frames.lock_blocking().alloc_below(count, limit)?;
        debug!("dma {frame} x{count} below {limit}");
        Some(frame)
    }

    pub fn free_dma(&self, frame: PhysicalPage<Size4K>, count: usize) {
        self.frames.lock_blocking().free(frame, count);
    }
}
