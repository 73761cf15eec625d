//! # Virtual Address Arena
//!
//! A resource allocator over ranges of virtual addresses, in the style of a
//! vmem arena: the kernel owns one arena for its dynamic half, every process
//! owns a "low" and a "high" arena.
//!
//! An arena covers one or more *spans*. Each span is introduced by a span
//! marker in an address-ordered segment list, followed by free and allocated
//! segments that tile it exactly:
//!
//! ```text
//! [span 0x1000..0x11000] [alloc 0x1000+5p] [free 0x6000+3p] [alloc 0x9000+8p]
//! ```
//!
//! Free segments additionally sit on one of 64 power-of-two freelists,
//! indexed by `floor(log2(size / quantum))`. Allocated segments sit in a
//! chained hash table keyed by their base, so [`Arena::free`] finds them
//! without walking the list.
//!
//! Segments live in a slot vector; all links are slot indices and released
//! slots are recycled through a spare list.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{VirtualAddress, align_up};
use log::{debug, error, trace, warn};

/// Number of power-of-two freelists.
const CLASSES: usize = 64;

/// Initial hash bucket count; always a power of two.
const INITIAL_BUCKETS: usize = 16;

type SegId = usize;

/// How [`Arena::alloc`] picks a free segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Take the head of the smallest class that is guaranteed to fit.
    #[default]
    InstantFit,
    /// Take the segment leaving the smallest remainder.
    BestFit,
    /// Continue after the previous allocation in address order, wrapping.
    NextFit,
}

/// Placement constraints for [`Arena::xalloc`].
///
/// Only the default (no constraint) is supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct XallocConstraints {
    pub align: u64,
    pub phase: u64,
    pub nocross: u64,
    pub min: u64,
    pub max: u64,
}

impl XallocConstraints {
    #[must_use]
    pub const fn is_unconstrained(&self) -> bool {
        self.align == 0 && self.phase == 0 && self.nocross == 0 && self.min == 0 && self.max == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Span,
    Free,
    Allocated,
}

/// A read-only view of one segment, as yielded by [`Arena::segments`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub base: VirtualAddress,
    pub size: u64,
    pub kind: SegmentKind,
}

/// Broken arena bookkeeping, reported by [`Arena::check_invariants`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaCorruption {
    #[error("segment at {0:#x} does not continue its span")]
    Gap(u64),
    #[error("span at {0:#x} is not fully covered")]
    Uncovered(u64),
    #[error("free segments at {0:#x} are adjacent")]
    AdjacentFree(u64),
    #[error("free segment at {0:#x} is not on its freelist")]
    Freelist(u64),
    #[error("allocated segment at {0:#x} is not in the hash table")]
    Hash(u64),
    #[error("free and allocated sizes do not add up to the span total")]
    Accounting,
}

#[derive(Debug, Clone)]
struct Segment {
    base: u64,
    size: u64,
    kind: SegmentKind,
    /// Address-ordered neighbours.
    prev: Option<SegId>,
    next: Option<SegId>,
    /// Freelist links while free; `link_next` chains the hash bucket while allocated.
    link_prev: Option<SegId>,
    link_next: Option<SegId>,
}

impl Segment {
    const fn new(base: u64, size: u64, kind: SegmentKind) -> Self {
        Self {
            base,
            size,
            kind,
            prev: None,
            next: None,
            link_prev: None,
            link_next: None,
        }
    }

    const fn end(&self) -> u64 {
        self.base + self.size
    }
}

pub struct Arena {
    name: &'static str,
    quantum: u64,
    slots: Vec<Segment>,
    spare: Vec<SegId>,
    head: Option<SegId>,
    freelists: [Option<SegId>; CLASSES],
    buckets: Vec<Option<SegId>>,
    allocated_segments: usize,
    /// End of the most recent allocation, for next-fit.
    cursor: Option<u64>,
    total: u64,
    free: u64,
    allocated: u64,
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("quantum", &self.quantum)
            .field("total", &self.total)
            .field("free", &self.free)
            .field("allocated", &self.allocated)
            .finish_non_exhaustive()
    }
}

impl Arena {
    /// Create an arena covering `[base, base + size)`.
    ///
    /// `quantum` must be a power of two and `base`/`size` multiples of it.
    /// A zero `size` creates an empty arena that can grow with [`Arena::add_span`].
    #[must_use]
    pub fn new(name: &'static str, base: VirtualAddress, size: u64, quantum: u64) -> Self {
        assert!(quantum.is_power_of_two(), "arena quantum must be a power of two");
        let mut arena = Self {
            name,
            quantum,
            slots: Vec::new(),
            spare: Vec::new(),
            head: None,
            freelists: [None; CLASSES],
            buckets: vec![None; INITIAL_BUCKETS],
            allocated_segments: 0,
            cursor: None,
            total: 0,
            free: 0,
            allocated: 0,
        };
        if size != 0 {
            arena.add_span(base, size);
        }
        arena
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn quantum(&self) -> u64 {
        self.quantum
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn free_size(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub const fn allocated_size(&self) -> u64 {
        self.allocated
    }

    /// Import another span. It must not overlap any span already present.
    pub fn add_span(&mut self, base: VirtualAddress, size: u64) {
        let base = base.as_u64();
        let q = self.quantum;
        assert!(
            base.is_multiple_of(q) && size.is_multiple_of(q) && size != 0,
            "arena span must be a non-empty multiple of the quantum"
        );
        let Some(end) = base.checked_add(size) else {
            error!("arena {}: span {base:#x}+{size:#x} wraps", self.name);
            panic!("arena span wraps the address space");
        };

        // Spans stay address ordered; find the last segment below `base`.
        let mut after = None;
        let mut it = self.head;
        while let Some(id) = it {
            let s = &self.slots[id];
            if s.kind == SegmentKind::Span && s.base < end && base < s.end() {
                error!(
                    "arena {}: span {base:#x}..{end:#x} overlaps {:#x}..{:#x}",
                    self.name,
                    s.base,
                    s.end()
                );
                panic!("arena spans must be disjoint");
            }
            if s.base >= end {
                break;
            }
            after = Some(id);
            it = s.next;
        }

        let span = self.new_slot(Segment::new(base, size, SegmentKind::Span));
        self.list_insert_after(after, span);
        let free = self.new_slot(Segment::new(base, size, SegmentKind::Free));
        self.list_insert_after(Some(span), free);
        self.freelist_push(free);

        self.total += size;
        self.free += size;
        debug!("arena {}: added span {base:#x}..{end:#x}", self.name);
    }

    /// Allocate `size` bytes (rounded up to the quantum).
    ///
    /// Returns `None` for a zero size or when no free segment fits.
    pub fn alloc(&mut self, size: u64, strategy: Strategy) -> Option<VirtualAddress> {
        self.xalloc(size, XallocConstraints::default(), strategy)
    }

    /// Allocate with placement constraints.
    ///
    /// # Panics
    /// On any constraint other than the default; constrained placement is not
    /// implemented.
    pub fn xalloc(
        &mut self,
        size: u64,
        constraints: XallocConstraints,
        strategy: Strategy,
    ) -> Option<VirtualAddress> {
        if !constraints.is_unconstrained() {
            error!("arena {}: unsupported xalloc constraints {constraints:?}", self.name);
            panic!("constrained arena allocation is not implemented");
        }
        if size == 0 {
            return None;
        }
        let size = align_up(size, self.quantum)?;

        let found = match strategy {
            Strategy::InstantFit => self.instant_fit(size),
            Strategy::BestFit => self.best_fit(size),
            Strategy::NextFit => self.next_fit(size),
        };
        let Some(id) = found else {
            warn!(
                "arena {}: no free segment for {size:#x} bytes ({:#x} free)",
                self.name, self.free
            );
            return None;
        };

        self.freelist_remove(id);
        let base = self.carve(id, size);
        self.cursor = Some(base + size);
        trace!("arena {}: alloc {base:#x}+{size:#x} ({strategy:?})", self.name);
        Some(VirtualAddress::new(base))
    }

    /// Reserve exactly `[base, base + size)`.
    ///
    /// Returns `None` if any part of the range is not free.
    pub fn claim(&mut self, base: VirtualAddress, size: u64) -> Option<VirtualAddress> {
        let base = base.as_u64();
        if size == 0 || !base.is_multiple_of(self.quantum) {
            return None;
        }
        let size = align_up(size, self.quantum)?;
        let end = base.checked_add(size)?;

        let mut it = self.head;
        let id = loop {
            let id = it?;
            let s = &self.slots[id];
            if s.kind == SegmentKind::Free && s.base <= base && end <= s.end() {
                break id;
            }
            if s.kind != SegmentKind::Span && s.base > base {
                return None;
            }
            it = s.next;
        };

        self.freelist_remove(id);
        let id = if self.slots[id].base < base {
            let s = &self.slots[id];
            let tail = Segment::new(base, s.end() - base, SegmentKind::Free);
            let tail = self.new_slot(tail);
            self.list_insert_after(Some(id), tail);
            self.slots[id].size = base - self.slots[id].base;
            self.freelist_push(id);
            tail
        } else {
            id
        };
        self.carve(id, size);
        trace!("arena {}: claimed {base:#x}+{size:#x}", self.name);
        Some(VirtualAddress::new(base))
    }

    /// Return an allocation.
    ///
    /// # Panics
    /// If `base` was not returned by this arena or `size` differs from the
    /// allocated size.
    pub fn free(&mut self, base: VirtualAddress, size: u64) {
        let base = base.as_u64();
        let Some(id) = self.hash_remove(base) else {
            error!("arena {}: free of unknown base {base:#x}", self.name);
            panic!("arena free of an address that was never allocated");
        };
        let held = self.slots[id].size;
        if align_up(size, self.quantum) != Some(held) {
            error!(
                "arena {}: free {base:#x} with size {size:#x}, allocated {held:#x}",
                self.name
            );
            panic!("arena free size does not match the allocation");
        }

        self.slots[id].kind = SegmentKind::Free;
        self.allocated -= held;
        self.free += held;

        if let Some(next) = self.slots[id].next
            && self.slots[next].kind == SegmentKind::Free
        {
            self.freelist_remove(next);
            self.slots[id].size += self.slots[next].size;
            self.list_remove(next);
            self.drop_slot(next);
        }

        let mut id = id;
        if let Some(prev) = self.slots[id].prev
            && self.slots[prev].kind == SegmentKind::Free
        {
            self.freelist_remove(prev);
            self.slots[prev].size += self.slots[id].size;
            self.list_remove(id);
            self.drop_slot(id);
            id = prev;
        }

        self.freelist_push(id);
        trace!("arena {}: free {base:#x}+{held:#x}", self.name);
    }

    /// All segments in address order, span markers included.
    pub fn segments(&self) -> impl Iterator<Item = SegmentInfo> + '_ {
        let mut it = self.head;
        core::iter::from_fn(move || {
            let s = &self.slots[it?];
            it = s.next;
            Some(SegmentInfo {
                base: VirtualAddress::new(s.base),
                size: s.size,
                kind: s.kind,
            })
        })
    }

    /// Verify the partition: segments tile each span without gaps or
    /// overlaps, free segments are never adjacent and sit on the right
    /// freelist, allocated segments are hashed and sizes add up.
    pub fn check_invariants(&self) -> Result<(), ArenaCorruption> {
        let mut span_end: Option<u64> = None;
        let mut cursor = 0;
        let mut prev_free = false;
        let (mut free, mut allocated, mut total) = (0, 0, 0);
        let mut free_segments = 0usize;

        let mut it = self.head;
        while let Some(id) = it {
            let s = &self.slots[id];
            match s.kind {
                SegmentKind::Span => {
                    if let Some(end) = span_end
                        && cursor != end
                    {
                        return Err(ArenaCorruption::Uncovered(end));
                    }
                    span_end = Some(s.end());
                    cursor = s.base;
                    total += s.size;
                    prev_free = false;
                }
                kind => {
                    if s.base != cursor || span_end.is_none_or(|end| s.end() > end) {
                        return Err(ArenaCorruption::Gap(s.base));
                    }
                    cursor = s.end();
                    if kind == SegmentKind::Free {
                        if prev_free {
                            return Err(ArenaCorruption::AdjacentFree(s.base));
                        }
                        if !self.on_freelist(id) {
                            return Err(ArenaCorruption::Freelist(s.base));
                        }
                        free += s.size;
                        free_segments += 1;
                    } else {
                        if self.hash_find(s.base) != Some(id) {
                            return Err(ArenaCorruption::Hash(s.base));
                        }
                        allocated += s.size;
                    }
                    prev_free = kind == SegmentKind::Free;
                }
            }
            it = s.next;
        }
        if let Some(end) = span_end
            && cursor != end
        {
            return Err(ArenaCorruption::Uncovered(end));
        }

        let listed: usize = (0..CLASSES).map(|c| self.freelist_iter(c).count()).sum();
        if listed != free_segments {
            return Err(ArenaCorruption::Accounting);
        }
        if free != self.free || allocated != self.allocated || total != self.total {
            return Err(ArenaCorruption::Accounting);
        }
        if free + allocated != total {
            return Err(ArenaCorruption::Accounting);
        }
        Ok(())
    }

    fn class_of(&self, size: u64) -> usize {
        (size / self.quantum).ilog2() as usize
    }

    fn instant_fit(&self, size: u64) -> Option<SegId> {
        let units = size / self.quantum;
        let floor = units.ilog2() as usize;
        let ceil = if units.is_power_of_two() { floor } else { floor + 1 };

        if let Some(id) = (ceil..CLASSES).find_map(|c| self.freelists[c]) {
            return Some(id);
        }
        // Segments in the floor class may still be large enough.
        self.freelist_iter(floor).find(|&id| self.slots[id].size >= size)
    }

    fn best_fit(&self, size: u64) -> Option<SegId> {
        // Every segment of a higher class is larger than any of a lower one,
        // so the first class holding a fit holds the best fit.
        (self.class_of(size)..CLASSES).find_map(|c| {
            self.freelist_iter(c)
                .filter(|&id| self.slots[id].size >= size)
                .min_by_key(|&id| (self.slots[id].size, self.slots[id].base))
        })
    }

    fn next_fit(&self, size: u64) -> Option<SegId> {
        let Some(cursor) = self.cursor else {
            return self.instant_fit(size);
        };

        let mut it = self.head;
        let mut start = None;
        while let Some(id) = it {
            let s = &self.slots[id];
            if s.kind != SegmentKind::Span && s.end() > cursor {
                start = Some(id);
                break;
            }
            it = s.next;
        }
        let start = start.or(self.head)?;

        let mut id = start;
        loop {
            let s = &self.slots[id];
            if s.kind == SegmentKind::Free && s.size >= size {
                return Some(id);
            }
            id = s.next.or(self.head)?;
            if id == start {
                return None;
            }
        }
    }

    /// Turn the front `size` bytes of free segment `id` (already off its
    /// freelist) into an allocation; the remainder goes back as a free segment.
    fn carve(&mut self, id: SegId, size: u64) -> u64 {
        let s = &self.slots[id];
        debug_assert_eq!(s.kind, SegmentKind::Free);
        let base = s.base;
        if s.size > size {
            let rest = Segment::new(base + size, s.size - size, SegmentKind::Free);
            let rest = self.new_slot(rest);
            self.list_insert_after(Some(id), rest);
            self.slots[id].size = size;
            self.freelist_push(rest);
        }
        self.slots[id].kind = SegmentKind::Allocated;
        self.hash_insert(id);
        self.free -= size;
        self.allocated += size;
        base
    }

    fn new_slot(&mut self, segment: Segment) -> SegId {
        if let Some(id) = self.spare.pop() {
            self.slots[id] = segment;
            id
        } else {
            self.slots.push(segment);
            self.slots.len() - 1
        }
    }

    fn drop_slot(&mut self, id: SegId) {
        self.spare.push(id);
    }

    fn list_insert_after(&mut self, after: Option<SegId>, id: SegId) {
        let next = match after {
            Some(a) => self.slots[a].next,
            None => self.head,
        };
        self.slots[id].prev = after;
        self.slots[id].next = next;
        match after {
            Some(a) => self.slots[a].next = Some(id),
            None => self.head = Some(id),
        }
        if let Some(n) = next {
            self.slots[n].prev = Some(id);
        }
    }

    fn list_remove(&mut self, id: SegId) {
        let (prev, next) = (self.slots[id].prev, self.slots[id].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
    }

    fn freelist_push(&mut self, id: SegId) {
        let class = self.class_of(self.slots[id].size);
        let head = self.freelists[class];
        self.slots[id].link_prev = None;
        self.slots[id].link_next = head;
        if let Some(h) = head {
            self.slots[h].link_prev = Some(id);
        }
        self.freelists[class] = Some(id);
    }

    fn freelist_remove(&mut self, id: SegId) {
        let class = self.class_of(self.slots[id].size);
        let (prev, next) = (self.slots[id].link_prev, self.slots[id].link_next);
        match prev {
            Some(p) => self.slots[p].link_next = next,
            None => self.freelists[class] = next,
        }
        if let Some(n) = next {
            self.slots[n].link_prev = prev;
        }
        self.slots[id].link_prev = None;
        self.slots[id].link_next = None;
    }

    fn freelist_iter(&self, class: usize) -> impl Iterator<Item = SegId> + '_ {
        let mut it = self.freelists[class];
        core::iter::from_fn(move || {
            let id = it?;
            it = self.slots[id].link_next;
            Some(id)
        })
    }

    fn on_freelist(&self, id: SegId) -> bool {
        self.freelist_iter(self.class_of(self.slots[id].size))
            .any(|other| other == id)
    }

    fn bucket_of(&self, base: u64) -> usize {
        let key = (base / self.quantum).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (key >> 32) as usize & (self.buckets.len() - 1)
    }

    fn hash_insert(&mut self, id: SegId) {
        if self.allocated_segments >= self.buckets.len() * 2 {
            self.rehash(self.buckets.len() * 2);
        }
        let bucket = self.bucket_of(self.slots[id].base);
        self.slots[id].link_next = self.buckets[bucket];
        self.slots[id].link_prev = None;
        self.buckets[bucket] = Some(id);
        self.allocated_segments += 1;
    }

    fn hash_find(&self, base: u64) -> Option<SegId> {
        let mut it = self.buckets[self.bucket_of(base)];
        while let Some(id) = it {
            if self.slots[id].base == base {
                return Some(id);
            }
            it = self.slots[id].link_next;
        }
        None
    }

    fn hash_remove(&mut self, base: u64) -> Option<SegId> {
        let bucket = self.bucket_of(base);
        let mut prev: Option<SegId> = None;
        let mut it = self.buckets[bucket];
        while let Some(id) = it {
            let next = self.slots[id].link_next;
            if self.slots[id].base == base {
                match prev {
                    Some(p) => self.slots[p].link_next = next,
                    None => self.buckets[bucket] = next,
                }
                self.slots[id].link_next = None;
                self.allocated_segments -= 1;
                return Some(id);
            }
            prev = Some(id);
            it = next;
        }
        None
    }

    fn rehash(&mut self, buckets: usize) {
        self.buckets = vec![None; buckets];
        let mut it = self.head;
        while let Some(id) = it {
            if self.slots[id].kind == SegmentKind::Allocated {
                let bucket = self.bucket_of(self.slots[id].base);
                self.slots[id].link_next = self.buckets[bucket];
                self.buckets[bucket] = Some(id);
            }
            it = self.slots[id].next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;
    const BASE: u64 = 0x1000_0000;

    fn arena(pages: u64) -> Arena {
        Arena::new("test", VirtualAddress::new(BASE), pages * PAGE, PAGE)
    }

    fn free_segments(a: &Arena) -> Vec<(u64, u64)> {
        a.segments()
            .filter(|s| s.kind == SegmentKind::Free)
            .map(|s| (s.base.as_u64(), s.size / PAGE))
            .collect()
    }

    #[test]
    fn fresh_arena_is_one_free_segment() {
        let a = arena(16);
        let segs: Vec<_> = a.segments().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].kind, SegmentKind::Span);
        assert_eq!(segs[1].kind, SegmentKind::Free);
        assert_eq!(a.total_size(), 16 * PAGE);
        assert_eq!(a.free_size(), 16 * PAGE);
        a.check_invariants().unwrap();
    }

    #[test]
    fn freed_hole_is_reused_around_live_allocation() {
        let mut a = arena(16);
        let first = a.alloc(5 * PAGE, Strategy::InstantFit).unwrap();
        let second = a.alloc(3 * PAGE, Strategy::InstantFit).unwrap();
        assert_eq!(first.as_u64(), BASE);
        assert_eq!(second.as_u64(), BASE + 5 * PAGE);

        a.free(first, 5 * PAGE);
        a.check_invariants().unwrap();

        let again = a.alloc(5 * PAGE, Strategy::InstantFit).unwrap();
        assert!(again.as_u64() != second.as_u64());
        assert_eq!(a.allocated_size(), 8 * PAGE);
        a.check_invariants().unwrap();
    }

    #[test]
    fn best_fit_takes_the_exact_hole() {
        let mut a = arena(16);
        let first = a.alloc(5 * PAGE, Strategy::BestFit).unwrap();
        let _second = a.alloc(3 * PAGE, Strategy::BestFit).unwrap();
        a.free(first, 5 * PAGE);

        let again = a.alloc(5 * PAGE, Strategy::BestFit).unwrap();
        assert_eq!(again, first);
        assert_eq!(free_segments(&a), vec![(BASE + 8 * PAGE, 8)]);
    }

    #[test]
    fn instant_fit_prefers_a_guaranteed_class() {
        let mut a = arena(16);
        let first = a.alloc(5 * PAGE, Strategy::InstantFit).unwrap();
        let _second = a.alloc(3 * PAGE, Strategy::InstantFit).unwrap();
        a.free(first, 5 * PAGE);

        // The 5-page hole is in class 2 and may not fit a 5-page request in
        // general; the 8-page tail in class 3 always does.
        let again = a.alloc(5 * PAGE, Strategy::InstantFit).unwrap();
        assert_eq!(again.as_u64(), BASE + 8 * PAGE);
    }

    #[test]
    fn instant_fit_falls_back_to_floor_class() {
        let mut a = arena(7);
        // Only a 7-page segment exists (class 2); a 5-page request needs class 3.
        let p = a.alloc(5 * PAGE, Strategy::InstantFit).unwrap();
        assert_eq!(p.as_u64(), BASE);
        assert_eq!(free_segments(&a), vec![(BASE + 5 * PAGE, 2)]);
    }

    #[test]
    fn next_fit_resumes_after_last_allocation() {
        let mut a = arena(16);
        let p0 = a.alloc(2 * PAGE, Strategy::NextFit).unwrap();
        let p1 = a.alloc(2 * PAGE, Strategy::NextFit).unwrap();
        a.free(p0, 2 * PAGE);

        // The hole at the start is skipped in favour of the space after p1.
        let p2 = a.alloc(2 * PAGE, Strategy::NextFit).unwrap();
        assert_eq!(p2.as_u64(), p1.as_u64() + 2 * PAGE);

        // Exhaust the tail, then wrap around to the hole.
        let rest = a.alloc(10 * PAGE, Strategy::NextFit).unwrap();
        assert_eq!(rest.as_u64(), BASE + 6 * PAGE);
        let wrapped = a.alloc(2 * PAGE, Strategy::NextFit).unwrap();
        assert_eq!(wrapped, p0);
        a.check_invariants().unwrap();
    }

    #[test]
    fn zero_and_oversized_requests_fail_cleanly() {
        let mut a = arena(4);
        assert_eq!(a.alloc(0, Strategy::InstantFit), None);
        assert_eq!(a.alloc(5 * PAGE, Strategy::BestFit), None);
        assert_eq!(a.free_size(), 4 * PAGE);
        a.check_invariants().unwrap();
    }

    #[test]
    fn sizes_round_up_to_the_quantum() {
        let mut a = arena(4);
        let p = a.alloc(1, Strategy::InstantFit).unwrap();
        assert_eq!(a.allocated_size(), PAGE);
        a.free(p, 1);
        assert_eq!(a.free_size(), 4 * PAGE);
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut a = arena(12);
        let p: Vec<_> = (0..4)
            .map(|_| a.alloc(3 * PAGE, Strategy::InstantFit).unwrap())
            .collect();
        a.free(p[0], 3 * PAGE);
        a.free(p[2], 3 * PAGE);
        assert_eq!(free_segments(&a).len(), 2);
        a.free(p[1], 3 * PAGE);
        assert_eq!(free_segments(&a), vec![(BASE, 9)]);
        a.free(p[3], 3 * PAGE);
        assert_eq!(free_segments(&a), vec![(BASE, 12)]);
        a.check_invariants().unwrap();
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn free_of_unknown_base_is_fatal() {
        let mut a = arena(4);
        a.free(VirtualAddress::new(BASE), PAGE);
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn free_with_wrong_size_is_fatal() {
        let mut a = arena(4);
        let p = a.alloc(2 * PAGE, Strategy::InstantFit).unwrap();
        a.free(p, PAGE);
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn constrained_xalloc_is_unsupported() {
        let mut a = arena(4);
        let c = XallocConstraints {
            align: 2 * PAGE,
            ..XallocConstraints::default()
        };
        let _ = a.xalloc(PAGE, c, Strategy::InstantFit);
    }

    #[test]
    fn default_xalloc_matches_alloc() {
        let mut a = arena(4);
        let p = a
            .xalloc(PAGE, XallocConstraints::default(), Strategy::BestFit)
            .unwrap();
        assert_eq!(p.as_u64(), BASE);
    }

    #[test]
    fn claim_reserves_a_fixed_range() {
        let mut a = arena(16);
        let at = VirtualAddress::new(BASE + 4 * PAGE);
        assert_eq!(a.claim(at, 2 * PAGE), Some(at));
        assert_eq!(
            free_segments(&a),
            vec![(BASE, 4), (BASE + 6 * PAGE, 10)]
        );
        // Overlapping claims fail.
        assert_eq!(a.claim(VirtualAddress::new(BASE + 5 * PAGE), PAGE), None);
        assert_eq!(a.claim(VirtualAddress::new(BASE + 3 * PAGE), 2 * PAGE), None);
        a.check_invariants().unwrap();

        a.free(at, 2 * PAGE);
        assert_eq!(free_segments(&a), vec![(BASE, 16)]);
    }

    #[test]
    fn claim_outside_any_span_fails() {
        let mut a = arena(4);
        assert_eq!(a.claim(VirtualAddress::new(BASE + 8 * PAGE), PAGE), None);
        assert_eq!(a.claim(VirtualAddress::new(BASE - PAGE), PAGE), None);
    }

    #[test]
    fn spans_stay_separate() {
        let mut a = arena(4);
        a.add_span(VirtualAddress::new(BASE + 4 * PAGE), 4 * PAGE);
        a.add_span(VirtualAddress::new(BASE - 8 * PAGE), 2 * PAGE);
        assert_eq!(a.total_size(), 10 * PAGE);
        a.check_invariants().unwrap();

        // Adjacent spans are never merged, so a single allocation cannot
        // straddle them.
        assert_eq!(a.alloc(6 * PAGE, Strategy::BestFit), None);
        let spans: Vec<_> = a
            .segments()
            .filter(|s| s.kind == SegmentKind::Span)
            .map(|s| s.base.as_u64())
            .collect();
        assert_eq!(spans, vec![BASE - 8 * PAGE, BASE, BASE + 4 * PAGE]);
    }

    #[test]
    #[should_panic(expected = "disjoint")]
    fn overlapping_span_is_fatal() {
        let mut a = arena(4);
        a.add_span(VirtualAddress::new(BASE + 2 * PAGE), 4 * PAGE);
    }

    #[test]
    fn many_allocations_grow_the_hash() {
        let mut a = arena(256);
        let all: Vec<_> = (0..256)
            .map(|_| a.alloc(PAGE, Strategy::InstantFit).unwrap())
            .collect();
        assert_eq!(a.free_size(), 0);
        a.check_invariants().unwrap();
        for (i, p) in all.iter().enumerate().rev() {
            if i % 2 == 0 {
                a.free(*p, PAGE);
            }
        }
        a.check_invariants().unwrap();
        for (i, p) in all.iter().enumerate() {
            if i % 2 == 1 {
                a.free(*p, PAGE);
            }
        }
        assert_eq!(free_segments(&a), vec![(BASE, 256)]);
        a.check_invariants().unwrap();
    }

    #[test]
    fn partition_holds_under_mixed_strategies() {
        let mut a = arena(64);
        let strategies = [Strategy::InstantFit, Strategy::BestFit, Strategy::NextFit];
        let mut live = Vec::new();
        let mut seed = 0x2545_F491_u64;
        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if seed % 3 == 0 && !live.is_empty() {
                let (p, n) = live.swap_remove((seed as usize / 3) % live.len());
                a.free(p, n * PAGE);
            } else {
                let pages = 1 + seed % 5;
                if let Some(p) = a.alloc(pages * PAGE, strategies[step % 3]) {
                    live.push((p, pages));
                }
            }
            a.check_invariants().unwrap();
        }
        for (p, n) in live {
            a.free(p, n * PAGE);
        }
        assert_eq!(a.allocated_size(), 0);
        assert_eq!(free_segments(&a), vec![(BASE, 64)]);
    }
}
