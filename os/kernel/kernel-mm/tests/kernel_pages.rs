mod common;

use common::{Machine, RAM_BASE, TestSpace};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_mm::VmmError;
use kernel_vmem::PageFlags;

#[test]
fn kernel_pages_are_global_and_writable() {
    let m = Machine::boot(64);
    let before = m.ctx.free_frames();
    let base = m.ctx.alloc_kernel_pages(4).unwrap();
    assert!(base >= m.ctx.layout().kernel.base);

    let kernel = m.ctx.kernel_space();
    for i in 0..4 {
        let t = kernel.translate(base + i * PAGE_SIZE).unwrap();
        assert!(t.flags.contains(PageFlags::WRITABLE | PageFlags::GLOBAL));
        assert!(!t.flags.contains(PageFlags::USER));
    }
    // four frames plus the PD and PT below the pre-populated PDPT
    assert_eq!(m.ctx.free_frames(), before - 6);

    m.ctx.free_kernel_pages(base, 4).unwrap();
    assert!(kernel.translate(base).is_none());
    assert_eq!(m.ctx.kernel_arena().lock_blocking().allocated_size(), 0);
    assert_eq!(m.ctx.free_frames(), before - 2);
}

#[test]
fn user_spaces_see_later_kernel_mappings() {
    let m = Machine::boot(64);
    let space = TestSpace::new_user(&m.ctx).unwrap();
    let base = m.ctx.alloc_kernel_pages(1).unwrap();
    let kernel = m.ctx.kernel_space().translate(base).unwrap();
    assert_eq!(space.translate(base), Some(kernel));
}

#[test]
fn empty_and_oversized_requests() {
    let m = Machine::boot(64);
    assert_eq!(m.ctx.alloc_kernel_pages(0), Err(VmmError::EmptyRequest));
    assert_eq!(m.ctx.alloc_kernel_pages(257), Err(VmmError::OutOfAddressSpace));
    assert_eq!(
        m.ctx.alloc_kernel_pages(usize::MAX),
        Err(VmmError::OutOfAddressSpace)
    );
    assert_eq!(m.ctx.free_kernel_pages(m.ctx.layout().kernel.base, 0), Ok(()));
}

#[test]
fn exhausted_frames_roll_back() {
    let m = Machine::boot(8);
    let before = m.ctx.free_frames();
    assert_eq!(m.ctx.alloc_kernel_pages(16), Err(VmmError::OutOfMemory));
    // the PD and PT stay; kernel tables are never reclaimed
    assert_eq!(m.ctx.free_frames(), before - 2);
    assert_eq!(m.ctx.kernel_arena().lock_blocking().allocated_size(), 0);

    let base = m.ctx.alloc_kernel_pages(2).unwrap();
    assert_eq!(base, m.ctx.layout().kernel.base);
}

#[test]
fn dma_memory_stays_below_the_limit() {
    let m = Machine::boot(64);
    let limit = PhysicalAddress::new(RAM_BASE + 32 * PAGE_SIZE);
    let frame = m.ctx.alloc_dma(4, limit).unwrap();
    assert!(frame.base().as_u64() + 4 * PAGE_SIZE <= limit.as_u64());
    assert!(frame.base().as_u64() >= RAM_BASE);

    assert_eq!(m.ctx.alloc_dma(1, PhysicalAddress::new(RAM_BASE)), None);

    let before = m.ctx.free_frames();
    m.ctx.free_dma(frame, 4);
    assert_eq!(m.ctx.free_frames(), before + 4);
}

#[test]
fn concurrent_kernel_allocations() {
    let m = Machine::boot(512);
    // first allocation builds the PD and PT
    let warm = m.ctx.alloc_kernel_pages(1).unwrap();
    m.ctx.free_kernel_pages(warm, 1).unwrap();
    let before = m.ctx.free_frames();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let ctx = &m.ctx;
            s.spawn(move || {
                let mut held = Vec::new();
                for round in 0..50u64 {
                    let pages = (1 + (t + round) % 4) as usize;
                    let base = ctx.alloc_kernel_pages(pages).unwrap();
                    held.push((base, pages));
                    if round % 3 == 2 {
                        for (base, pages) in held.drain(..) {
                            ctx.free_kernel_pages(base, pages).unwrap();
                        }
                    }
                }
                for (base, pages) in held {
                    ctx.free_kernel_pages(base, pages).unwrap();
                }
            });
        }
    });

    let arena = m.ctx.kernel_arena().lock_blocking();
    assert_eq!(arena.allocated_size(), 0);
    assert!(arena.check_invariants().is_ok());
    drop(arena);
    assert_eq!(m.ctx.free_frames(), before);
}
