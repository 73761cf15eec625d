//! # Page-Fault Resolution
//!
//! A fault either becomes a valid translation or is escalated to the caller
//! (which typically terminates the faulting task):
//!
//! ```text
//!              ┌─ no mapping / access not allowed ──────────► Escalated
//! Faulted ─────┼─ translation already allows the access ────► Resolved (spurious)
//!              ├─ copy-on-write + write + frame present ────► Resolved (copied)
//!              ├─ on-demand + no frame ─────────────────────► Resolved (populated)
//!              └─ anything else ────────────────────────────► Escalated
//! ```
//!
//! The resolver only consumes the [`MappingRegistry`]; the caller holds the
//! registry lock for the whole resolution, which also serializes edits of
//! the faulting address space.

use crate::SharedFrames;
use crate::mapping::{MappingFlags, MappingRegistry};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, PageFlags, PhysMapper, TlbInvalidate};
use log::{trace, warn};

/// Error code pushed by the CPU for `#PF`.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// The page was present; the fault is a protection violation.
    pub present: bool,
    pub write: bool,
    /// The access came from ring 3.
    pub user: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// A decoded page fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address (CR2).
    pub address: VirtualAddress,
    pub access: FaultAccess,
    /// Raised by user-mode code.
    pub user: bool,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, access: FaultAccess, user: bool) -> Self {
        Self {
            address,
            access,
            user,
        }
    }

    #[must_use]
    pub const fn from_error_code(address: VirtualAddress, code: PageFaultErrorCode) -> Self {
        let access = if code.instruction_fetch() {
            FaultAccess::Execute
        } else if code.write() {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        };
        Self::new(address, access, code.user())
    }

    fn allowed_by(&self, flags: MappingFlags) -> bool {
        let needed = match self.access {
            FaultAccess::Read => MappingFlags::READ,
            FaultAccess::Write => MappingFlags::WRITE,
            FaultAccess::Execute => MappingFlags::EXECUTE,
        };
        flags.contains(needed) && (!self.user || flags.contains(MappingFlags::USER))
    }

    fn satisfied_by(&self, flags: PageFlags) -> bool {
        let ok = match self.access {
            FaultAccess::Read => true,
            FaultAccess::Write => flags.contains(PageFlags::WRITABLE),
            FaultAccess::Execute => flags.contains(PageFlags::EXECUTABLE),
        };
        ok && (!self.user || flags.contains(PageFlags::USER))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A private copy of a shared frame was installed writable.
    CopiedOnWrite { frame: PhysicalPage<Size4K> },
    /// A fresh frame was installed for an on-demand page.
    Populated {
        frame: PhysicalPage<Size4K>,
        zeroed: bool,
    },
    /// The translation already allows the access; another core got here first.
    Spurious,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscalationReason {
    #[error("no mapping covers the address")]
    NoMapping,
    #[error("the mapping does not permit the access")]
    AccessDenied,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("the fault cannot be resolved")]
    Unresolvable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved(Resolution),
    Escalated(EscalationReason),
}

impl FaultOutcome {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// Resolve `fault` in `space` according to `registry`.
///
/// Frames come from and go back to `frames`; `tlb` invalidates the edited
/// translation on every core the space is active on.
pub fn resolve<M, A, T>(
    space: &AddressSpace<'_, M>,
    registry: &MappingRegistry,
    frames: &mut A,
    tlb: &T,
    fault: &PageFault,
) -> FaultOutcome
where
    M: PhysMapper,
    A: SharedFrames + ?Sized,
    T: TlbInvalidate + ?Sized,
{
    let outcome = resolve_inner(space, registry, frames, tlb, fault);
    match outcome {
        FaultOutcome::Resolved(how) => trace!("fault at {} resolved: {how:?}", fault.address),
        FaultOutcome::Escalated(why) => warn!(
            "{:?} fault at {} (user: {}) escalated: {why}",
            fault.access, fault.address, fault.user
        ),
    }
    outcome
}

fn resolve_inner<M, A, T>(
    space: &AddressSpace<'_, M>,
    registry: &MappingRegistry,
    frames: &mut A,
    tlb: &T,
    fault: &PageFault,
) -> FaultOutcome
where
    M: PhysMapper,
    A: SharedFrames + ?Sized,
    T: TlbInvalidate + ?Sized,
{
    let Some(mapping) = registry.find(fault.address) else {
        return FaultOutcome::Escalated(EscalationReason::NoMapping);
    };
    if !fault.allowed_by(mapping.flags) {
        return FaultOutcome::Escalated(EscalationReason::AccessDenied);
    }

    let page = fault.address.page::<Size4K>().base();
    let current = space.translate(page);
    if let Some(t) = current
        && fault.satisfied_by(t.flags)
    {
        return FaultOutcome::Resolved(Resolution::Spurious);
    }

    match current {
        Some(t)
            if mapping.flags.contains(MappingFlags::COPY_ON_WRITE)
                && fault.access == FaultAccess::Write =>
        {
            if t.flags.contains(PageFlags::HUGE) {
                return FaultOutcome::Escalated(EscalationReason::Unresolvable);
            }
            let original = PhysicalPage::<Size4K>::from_addr(t.frame);
            let Some(copy) = frames.alloc_4k() else {
                return FaultOutcome::Escalated(EscalationReason::OutOfMemory);
            };
            space.mapper().copy_frame(original, copy);

            let flags = mapping.flags.page_flags(true);
            match space.map(frames, tlb, page, copy.base(), flags, false) {
                Ok(()) => {
                    frames.release(original);
                }
                Err(MapError::Shootdown(e)) => {
                    // A remote core may still read through the old entry.
                    warn!("keeping {original} referenced after failed shootdown: {e}");
                }
                Err(e) => return fail(frames, copy, e),
            }
            FaultOutcome::Resolved(Resolution::CopiedOnWrite { frame: copy })
        }
        None if mapping.flags.contains(MappingFlags::ON_DEMAND) => {
            let Some(frame) = frames.alloc_4k() else {
                return FaultOutcome::Escalated(EscalationReason::OutOfMemory);
            };
            let zeroed = mapping.flags.contains(MappingFlags::ZERO_FILL);
            if zeroed {
                space.mapper().zero_frame(frame);
            }

            let flags = mapping.flags.page_flags(true);
            match space.map(frames, tlb, page, frame.base(), flags, false) {
                // Absent entries are never cached, so a late acknowledgment is harmless.
                Ok(()) | Err(MapError::Shootdown(_)) => {}
                Err(e) => return fail(frames, frame, e),
            }
            FaultOutcome::Resolved(Resolution::Populated { frame, zeroed })
        }
        _ => FaultOutcome::Escalated(EscalationReason::Unresolvable),
    }
}

fn fail<A: SharedFrames + ?Sized>(
    frames: &mut A,
    frame: PhysicalPage<Size4K>,
    err: MapError,
) -> FaultOutcome {
    frames.release(frame);
    match err {
        MapError::OutOfMemory => FaultOutcome::Escalated(EscalationReason::OutOfMemory),
        _ => FaultOutcome::Escalated(EscalationReason::Unresolvable),
    }
}
