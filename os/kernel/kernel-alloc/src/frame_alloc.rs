//! # Buddy Frame Allocator
//!
//! Owns all physical memory handed to it as [`Region`]s and serves runs of
//! contiguous 4 KiB frames in power-of-two blocks.
//!
//! ## Layout
//!
//! Every region keeps one `Frame` descriptor per page. Free blocks are
//! threaded through per-order doubly linked freelists; the links are
//! `FrameId` handles (region index, frame index) into the descriptor
//! vectors, never pointers.
//!
//! ```text
//! order 0 ─► [f9] ⇄ [f3]
//! order 1 ─► [f10..f11]
//! order 2 ─► (empty)
//! order 3 ─► [f16..f23] ⇄ [f24..f31]
//! ```
//!
//! ## Buddies
//!
//! A region's leading `used_pages` frames are never handed out (kernel image,
//! firmware tables). Buddy pairing is computed relative to the first frame
//! after them: the buddy of the block at offset `o` with order `k` is at
//! `o ^ (1 << k)`. `used_pages` is fixed when the region is registered and
//! must never change afterwards, or pairing would compute wrong buddies.
//!
//! ## Sharing
//!
//! Every frame carries a reference count, `1` while allocated and `> 1` while
//! shared copy-on-write. [`FrameAllocator::release`] drops one reference and
//! frees the frame with the last one. Counts are only changed under the lock
//! that guards the allocator.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{BUDDY_MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use kernel_vmem::FrameAlloc;
use log::{debug, error, trace, warn};

/// Number of freelists (`0..=BUDDY_MAX_ORDER`).
const ORDERS: usize = BUDDY_MAX_ORDER + 1;

/// Handle of one frame descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FrameId {
    region: u32,
    index: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameState {
    Free,
    Used,
}

/// Descriptor of one physical page.
#[derive(Debug)]
struct Frame {
    state: FrameState,
    /// Set only while the frame heads a block on a freelist.
    order: Option<u8>,
    refs: AtomicU32,
    prev: Option<FrameId>,
    next: Option<FrameId>,
}

impl Frame {
    const fn new(state: FrameState) -> Self {
        Self {
            state,
            order: None,
            refs: AtomicU32::new(if matches!(state, FrameState::Used) { 1 } else { 0 }),
            prev: None,
            next: None,
        }
    }
}

/// A contiguous span of physical memory with a descriptor for every page.
#[derive(Debug)]
pub struct Region {
    base: PhysicalAddress,
    frames: Vec<Frame>,
    used_pages: usize,
}

impl Region {
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.frames.len() as u64 * PAGE_SIZE)
    }

    #[must_use]
    pub const fn used_pages(&self) -> usize {
        self.used_pages
    }

    /// Frames that take part in buddy allocation.
    const fn usable(&self) -> usize {
        self.frames.len() - self.used_pages
    }
}

/// Buddy allocator over all registered [`Region`]s.
pub struct FrameAllocator {
    regions: Vec<Region>,
    heads: [Option<FrameId>; ORDERS],
    blocks: [usize; ORDERS],
    free_frames: usize,
    total_frames: usize,
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest order whose block holds `count` frames.
#[inline]
const fn order_for(count: usize) -> usize {
    count.next_power_of_two().trailing_zeros() as usize
}

impl FrameAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            heads: [None; ORDERS],
            blocks: [0; ORDERS],
            free_frames: 0,
            total_frames: 0,
        }
    }

    /// Register `[base, base + size)`; every page becomes allocatable.
    ///
    /// # Panics
    /// If `base` is not above the end of every previously registered region.
    pub fn add_region(&mut self, base: PhysicalAddress, size: u64) {
        self.add_region_reserved(base, size, 0);
    }

    /// Register `[base, base + size)` with its first `used_pages` frames
    /// permanently in use.
    ///
    /// The range is shrunk to whole pages. `used_pages` is fixed from here on.
    ///
    /// # Panics
    /// If `base` is not above the end of every previously registered region
    /// (touching regions are rejected too), or if `used_pages` exceeds the
    /// region.
    pub fn add_region_reserved(&mut self, base: PhysicalAddress, size: u64, used_pages: usize) {
        if let Some(last) = self.regions.last()
            && base <= last.end()
        {
            error!("region at {base} registered at or below the end of {}", last.end());
            panic!("physical regions must be registered in increasing address order");
        }

        let start = align_up(base.as_u64(), PAGE_SIZE).unwrap_or(u64::MAX);
        let end = align_down(base.as_u64().saturating_add(size), PAGE_SIZE);
        let pages = usize::try_from(end.saturating_sub(start) / PAGE_SIZE).unwrap_or(0);
        if used_pages > pages {
            error!("region at {base} has {pages} pages, {used_pages} reserved");
            panic!("reserved page count exceeds the region");
        }

        let mut frames = Vec::with_capacity(pages);
        frames.extend((0..used_pages).map(|_| Frame::new(FrameState::Used)));
        frames.extend((used_pages..pages).map(|_| Frame::new(FrameState::Free)));

        let region = self.regions.len();
        self.regions.push(Region {
            base: PhysicalAddress::new(start),
            frames,
            used_pages,
        });
        self.total_frames += pages;
        self.free_range(region, 0, pages - used_pages);

        debug!(
            "frame region {:#x}..{:#x}: {pages} pages, {used_pages} reserved",
            start, end
        );
    }

    /// Allocate `count` contiguous frames, rounded up to a power of two.
    ///
    /// Returns `None` when `count` is zero, exceeds the largest block, or no
    /// block is free.
    pub fn alloc(&mut self, count: usize) -> Option<PhysicalPage<Size4K>> {
        if count == 0 {
            return None;
        }
        let order = order_for(count);
        if order > BUDDY_MAX_ORDER {
            warn!("request for {count} frames exceeds the largest block");
            return None;
        }

        let Some((id, found)) = (order..ORDERS).find_map(|o| self.heads[o].map(|id| (id, o)))
        else {
            warn!("out of physical memory for {count} frames");
            return None;
        };
        self.detach(found, id);
        Some(self.take_block(id, found, order))
    }

    /// Allocate `count` contiguous frames that lie entirely below `limit`
    /// (DMA-capable memory for devices with narrow address lines).
    pub fn alloc_below(
        &mut self,
        count: usize,
        limit: PhysicalAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        if count == 0 {
            return None;
        }
        let order = order_for(count);
        if order > BUDDY_MAX_ORDER {
            return None;
        }

        // Only the low end of a donor block is kept, so it suffices for that
        // part to fit below the limit.
        let need = (1u64 << order) * PAGE_SIZE;
        for o in order..ORDERS {
            let mut cursor = self.heads[o];
            while let Some(id) = cursor {
                if self.address(id).as_u64() + need <= limit.as_u64() {
                    self.detach(o, id);
                    return Some(self.take_block(id, o, order));
                }
                cursor = self.frame(id).next;
            }
        }
        warn!("no {count} free frames below {limit}");
        None
    }

    /// Split the detached block `id` of order `found` down to `order`, pushing
    /// the upper halves back, and mark the kept frames used.
    fn take_block(&mut self, id: FrameId, mut found: usize, order: usize) -> PhysicalPage<Size4K> {
        while found > order {
            found -= 1;
            let upper = FrameId {
                region: id.region,
                index: id.index + (1 << found),
            };
            self.push(found, upper);
        }

        for i in 0..(1u32 << order) {
            let f = self.frame_mut(FrameId {
                region: id.region,
                index: id.index + i,
            });
            debug_assert_eq!(f.state, FrameState::Free);
            f.state = FrameState::Used;
            f.refs.store(1, Ordering::Relaxed);
        }
        self.free_frames -= 1 << order;

        let page = PhysicalPage::from_addr(self.address(id));
        trace!("alloc {page} order {order}");
        page
    }

    /// Return `count` frames starting at `frame`, as obtained from
    /// [`alloc`](Self::alloc) with the same `count`.
    ///
    /// Zero-size frees are no-ops. Counts above the largest block release the
    /// range in top-order chunks.
    ///
    /// # Panics
    /// On double free, on frames outside every region, and on reserved frames.
    pub fn free(&mut self, frame: PhysicalPage<Size4K>, count: usize) {
        if count == 0 {
            return;
        }
        let id = self.locate_or_die(frame);
        let pages = if order_for(count) > BUDDY_MAX_ORDER {
            count
        } else {
            1 << order_for(count)
        };

        let region = &self.regions[id.region as usize];
        let first = id.index as usize;
        if first < region.used_pages || first + pages > region.frames.len() {
            error!("free of {frame} x{count} outside the allocatable part of its region");
            panic!("free of reserved or out-of-region frames");
        }

        for i in 0..pages {
            let f = &mut self.regions[id.region as usize].frames[first + i];
            if f.state != FrameState::Used {
                error!(
                    "double free of {} (freeing {frame} x{count})",
                    frame.offset_pages(i as u64)
                );
                panic!("double free of a physical frame");
            }
            f.state = FrameState::Free;
            f.refs.store(0, Ordering::Relaxed);
        }
        trace!("free {frame} x{pages}");

        let used = self.regions[id.region as usize].used_pages;
        self.free_range(id.region as usize, first - used, pages);
    }

    /// Take an additional reference on an allocated frame (COW sharing).
    ///
    /// # Panics
    /// If the frame is not allocated.
    pub fn share(&mut self, frame: PhysicalPage<Size4K>) {
        let id = self.locate_or_die(frame);
        let f = self.frame(id);
        if f.state != FrameState::Used {
            error!("share of free frame {frame}");
            panic!("share of a free physical frame");
        }
        f.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; the frame is freed with the last one.
    ///
    /// Returns `true` if the frame was freed.
    ///
    /// # Panics
    /// If the frame is not allocated.
    pub fn release(&mut self, frame: PhysicalPage<Size4K>) -> bool {
        let id = self.locate_or_die(frame);
        let f = self.frame(id);
        if f.state != FrameState::Used {
            error!("release of free frame {frame}");
            panic!("release of a free physical frame");
        }
        if f.refs.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.free(frame, 1);
            true
        } else {
            false
        }
    }

    /// Current reference count; `0` for free or unknown frames.
    #[must_use]
    pub fn ref_count(&self, frame: PhysicalPage<Size4K>) -> u32 {
        self.locate(frame)
            .map_or(0, |id| self.frame(id).refs.load(Ordering::Relaxed))
    }

    /// `true` if `frame` belongs to a registered region.
    #[must_use]
    pub fn contains(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.locate(frame).is_some()
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// All frames of all regions, reserved ones included.
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Number of free blocks of `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.blocks.get(order).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Free the frames at usable offsets `[rel, rel + pages)` of `region` as
    /// maximal aligned blocks, merging each with its buddies.
    fn free_range(&mut self, region: usize, mut rel: usize, pages: usize) {
        let end = rel + pages;
        while rel < end {
            let mut order = BUDDY_MAX_ORDER;
            while order > 0 && (rel & ((1 << order) - 1) != 0 || rel + (1 << order) > end) {
                order -= 1;
            }
            self.insert_coalescing(region, rel, order);
            rel += 1 << order;
        }
    }

    fn insert_coalescing(&mut self, region: usize, mut rel: usize, mut order: usize) {
        let (used, usable) = {
            let r = &self.regions[region];
            (r.used_pages, r.usable())
        };
        self.free_frames += 1 << order;

        while order < BUDDY_MAX_ORDER {
            let buddy_rel = rel ^ (1 << order);
            if buddy_rel + (1 << order) > usable {
                break;
            }
            let buddy = Self::id(region, used + buddy_rel);
            let b = self.frame(buddy);
            if b.state != FrameState::Free || b.order != Some(order as u8) {
                break;
            }
            self.detach(order, buddy);
            rel = rel.min(buddy_rel);
            order += 1;
        }
        self.push(order, Self::id(region, used + rel));
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn id(region: usize, index: usize) -> FrameId {
        FrameId {
            region: region as u32,
            index: index as u32,
        }
    }

    fn push(&mut self, order: usize, id: FrameId) {
        let head = self.heads[order];
        {
            let f = self.frame_mut(id);
            f.order = Some(order as u8);
            f.prev = None;
            f.next = head;
        }
        if let Some(h) = head {
            self.frame_mut(h).prev = Some(id);
        }
        self.heads[order] = Some(id);
        self.blocks[order] += 1;
    }

    fn detach(&mut self, order: usize, id: FrameId) {
        let (prev, next) = {
            let f = self.frame_mut(id);
            debug_assert_eq!(f.order, Some(order as u8), "freelist corruption");
            f.order = None;
            (f.prev.take(), f.next.take())
        };
        match prev {
            Some(p) => self.frame_mut(p).next = next,
            None => self.heads[order] = next,
        }
        if let Some(n) = next {
            self.frame_mut(n).prev = prev;
        }
        self.blocks[order] -= 1;
    }

    fn frame(&self, id: FrameId) -> &Frame {
        &self.regions[id.region as usize].frames[id.index as usize]
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        &mut self.regions[id.region as usize].frames[id.index as usize]
    }

    fn address(&self, id: FrameId) -> PhysicalAddress {
        self.regions[id.region as usize].base + u64::from(id.index) * PAGE_SIZE
    }

    fn locate(&self, frame: PhysicalPage<Size4K>) -> Option<FrameId> {
        let pa = frame.base();
        let r = self.regions.partition_point(|r| r.base <= pa).checked_sub(1)?;
        let region = &self.regions[r];
        if pa >= region.end() {
            return None;
        }
        let index = usize::try_from((pa - region.base) / PAGE_SIZE).ok()?;
        Some(Self::id(r, index))
    }

    fn locate_or_die(&self, frame: PhysicalPage<Size4K>) -> FrameId {
        if let Some(id) = self.locate(frame) {
            return id;
        }
        error!("frame {frame} is not part of any registered region");
        panic!("unknown physical frame");
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc(1)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free(frame, 1);
    }
}
