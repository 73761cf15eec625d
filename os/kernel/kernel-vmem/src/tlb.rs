//! # TLB Invalidation
//!
//! Every successful edit of a mapping is followed by an invalidation of the
//! affected range through a [`TlbInvalidate`] implementation:
//!
//! * [`LocalTlb`] flushes only the executing core (boot, single-core use).
//! * [`Shootdown`] flushes locally and then asks every other core the address
//!   space is active on to do the same, via a per-core [`ShootdownMailbox`]
//!   slot and an IPI.
//!
//! ## Mailbox protocol
//!
//! ```text
//! initiator                          remote core (IPI handler)
//! ---------                          -------------------------
//! IDLE --claim--> CLAIMED
//! write va/pages
//! CLAIMED -----> POSTED ---IPI--->   POSTED --> RUNNING
//!                                    flush_local(va, pages)
//!                                    RUNNING --> ACKED
//! ACKED ------> IDLE
//! ```
//!
//! The initiator waits at most the configured spin budget. On expiry a
//! request still `POSTED` is taken back (`POSTED -> IDLE`) and a request
//! already `RUNNING` is marked `ABANDONED`, in which case the remote handler
//! returns the slot to `IDLE` itself. Either way the initiator reports
//! [`ShootdownError::Timeout`] instead of hanging on a wedged core.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use kernel_info::memory::MAX_CPUS;
use kernel_memory_addresses::VirtualAddress;
use log::{error, trace};

/// Logical core number, `0..MAX_CPUS`.
pub type CpuId = usize;

/// Errors reported by cross-core invalidation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShootdownError {
    #[error("TLB shootdown to CPU {cpu} was not acknowledged in time")]
    Timeout { cpu: CpuId },
}

/// Invalidates cached translations for `pages` 4 KiB pages starting at `va`.
pub trait TlbInvalidate {
    /// # Errors
    /// [`ShootdownError::Timeout`] if a remote core did not acknowledge.
    fn invalidate(&self, va: VirtualAddress, pages: u64) -> Result<(), ShootdownError>;
}

impl<T: TlbInvalidate + ?Sized> TlbInvalidate for &T {
    fn invalidate(&self, va: VirtualAddress, pages: u64) -> Result<(), ShootdownError> {
        (**self).invalidate(va, pages)
    }
}

/// Set of cores as a 64-bit mask.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Cores `0..n`.
    #[must_use]
    pub const fn first(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu))
    }

    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu))
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member cores in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS).filter(move |&c| self.contains(c))
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// A [`CpuMask`] that can be updated concurrently, e.g. the set of cores an
/// address space is currently loaded on.
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    #[must_use]
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    pub fn insert(&self, cpu: CpuId) {
        debug_assert!(cpu < MAX_CPUS);
        self.0.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    pub fn remove(&self, cpu: CpuId) {
        debug_assert!(cpu < MAX_CPUS);
        self.0.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    #[must_use]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }
}

/// Hooks into the interrupt controller and the executing core.
pub trait TlbPlatform: Sync {
    /// Core executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Invalidate `pages` pages at `va` on the executing core.
    fn flush_local(&self, va: VirtualAddress, pages: u64);

    /// Deliver the invalidation IPI to `cpu`; its handler must call
    /// [`ShootdownMailbox::handle_ipi`].
    fn send_invalidate_ipi(&self, cpu: CpuId);
}

const IDLE: u8 = 0;
const CLAIMED: u8 = 1;
const POSTED: u8 = 2;
const RUNNING: u8 = 3;
const ACKED: u8 = 4;
const ABANDONED: u8 = 5;

struct Slot {
    state: AtomicU8,
    va: AtomicU64,
    pages: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            va: AtomicU64::new(0),
            pages: AtomicU64::new(0),
        }
    }
}

/// Per-core request slots for cross-core invalidation.
pub struct ShootdownMailbox {
    slots: [Slot; MAX_CPUS],
}

impl Default for ShootdownMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ShootdownMailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; MAX_CPUS],
        }
    }

    /// IPI handler entry for `cpu`: performs a posted request, if any.
    ///
    /// Returns `true` if a request was handled.
    pub fn handle_ipi<P: TlbPlatform + ?Sized>(&self, cpu: CpuId, platform: &P) -> bool {
        let slot = &self.slots[cpu];
        if slot
            .state
            .compare_exchange(POSTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let va = VirtualAddress::new(slot.va.load(Ordering::Relaxed));
        let pages = slot.pages.load(Ordering::Relaxed);
        platform.flush_local(va, pages);

        if slot
            .state
            .compare_exchange(RUNNING, ACKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the initiator gave up on us
            slot.state.store(IDLE, Ordering::Release);
        }
        true
    }

    /// Claim the slot of `cpu` and publish a request. Spends at most `budget`
    /// spins waiting for a previous request from another initiator.
    fn post(&self, cpu: CpuId, va: VirtualAddress, pages: u64, budget: u64) -> bool {
        let slot = &self.slots[cpu];
        let mut spins = 0;
        while slot
            .state
            .compare_exchange_weak(IDLE, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins >= budget {
                return false;
            }
            spin_loop();
        }
        slot.va.store(va.as_u64(), Ordering::Relaxed);
        slot.pages.store(pages, Ordering::Relaxed);
        slot.state.store(POSTED, Ordering::Release);
        true
    }

    /// Wait for the acknowledgment of `cpu`, cancelling on budget expiry.
    fn wait(&self, cpu: CpuId, budget: u64) -> Result<(), ShootdownError> {
        let slot = &self.slots[cpu];
        for _ in 0..budget {
            if slot.state.load(Ordering::Acquire) == ACKED {
                slot.state.store(IDLE, Ordering::Release);
                return Ok(());
            }
            spin_loop();
        }

        // Take the request back if the remote never picked it up.
        match slot
            .state
            .compare_exchange(POSTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(ACKED) => {
                slot.state.store(IDLE, Ordering::Release);
                return Ok(());
            }
            Err(_) => {
                if slot
                    .state
                    .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // finished between the two exchanges
                    slot.state.store(IDLE, Ordering::Release);
                    return Ok(());
                }
            }
        }
        error!("TLB shootdown to CPU {cpu} timed out");
        Err(ShootdownError::Timeout { cpu })
    }
}

/// Invalidation on the executing core and on every core in `targets`.
pub struct Shootdown<'a, P: TlbPlatform + ?Sized> {
    mailbox: &'a ShootdownMailbox,
    platform: &'a P,
    targets: CpuMask,
    budget: u64,
}

impl<'a, P: TlbPlatform + ?Sized> Shootdown<'a, P> {
    #[must_use]
    pub const fn new(
        mailbox: &'a ShootdownMailbox,
        platform: &'a P,
        targets: CpuMask,
        budget: u64,
    ) -> Self {
        Self {
            mailbox,
            platform,
            targets,
            budget,
        }
    }
}

impl<P: TlbPlatform + ?Sized> TlbInvalidate for Shootdown<'_, P> {
    fn invalidate(&self, va: VirtualAddress, pages: u64) -> Result<(), ShootdownError> {
        let me = self.platform.current_cpu();
        self.platform.flush_local(va, pages);

        let remote = self.targets.without(me);
        if remote.is_empty() {
            return Ok(());
        }
        trace!("shootdown {va} x{pages} to {remote:?}");

        let mut posted = CpuMask::empty();
        let mut result = Ok(());
        for cpu in remote.iter() {
            if self.mailbox.post(cpu, va, pages, self.budget) {
                posted = posted.with(cpu);
                self.platform.send_invalidate_ipi(cpu);
            } else {
                error!("TLB shootdown slot of CPU {cpu} stayed busy");
                result = Err(ShootdownError::Timeout { cpu });
            }
        }

        for cpu in posted.iter() {
            if let Err(e) = self.mailbox.wait(cpu, self.budget) {
                result = result.and(Err(e));
            }
        }
        result
    }
}

/// Invalidation on the executing core only.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalTlb;

impl TlbInvalidate for LocalTlb {
    fn invalidate(&self, va: VirtualAddress, pages: u64) -> Result<(), ShootdownError> {
        crate::arch::flush_range(va, pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    /// Records flushes per core; core 0 is the initiator.
    struct FakePlatform {
        flushes: Mutex<Vec<(CpuId, u64, u64)>>,
        ipis: Mutex<Vec<CpuId>>,
    }

    thread_local! {
        static CPU: std::cell::Cell<CpuId> = const { std::cell::Cell::new(0) };
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                flushes: Mutex::new(Vec::new()),
                ipis: Mutex::new(Vec::new()),
            }
        }
    }

    impl TlbPlatform for FakePlatform {
        fn current_cpu(&self) -> CpuId {
            CPU.with(std::cell::Cell::get)
        }

        fn flush_local(&self, va: VirtualAddress, pages: u64) {
            self.flushes
                .lock()
                .unwrap()
                .push((self.current_cpu(), va.as_u64(), pages));
        }

        fn send_invalidate_ipi(&self, cpu: CpuId) {
            self.ipis.lock().unwrap().push(cpu);
        }
    }

    #[test]
    fn cpu_mask_basics() {
        let m = CpuMask::first(3).without(1);
        assert!(m.contains(0));
        assert!(!m.contains(1));
        assert!(m.contains(2));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(CpuMask::first(64).bits(), u64::MAX);
    }

    #[test]
    fn single_core_only_flushes_locally() {
        let platform = FakePlatform::new();
        let mailbox = ShootdownMailbox::new();
        let sd = Shootdown::new(&mailbox, &platform, CpuMask::first(1), 1000);
        sd.invalidate(VirtualAddress::new(0x1000), 1).unwrap();
        assert_eq!(*platform.flushes.lock().unwrap(), vec![(0, 0x1000, 1)]);
        assert!(platform.ipis.lock().unwrap().is_empty());
    }

    #[test]
    fn remote_cores_acknowledge() {
        let platform = Arc::new(FakePlatform::new());
        let mailbox = Arc::new(ShootdownMailbox::new());
        let stop = Arc::new(AtomicBool::new(false));

        let remotes: Vec<_> = (1..3)
            .map(|cpu| {
                let platform = Arc::clone(&platform);
                let mailbox = Arc::clone(&mailbox);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    CPU.with(|c| c.set(cpu));
                    while !stop.load(Ordering::Acquire) {
                        mailbox.handle_ipi(cpu, &*platform);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let sd = Shootdown::new(&mailbox, &*platform, CpuMask::first(3), u64::MAX);
        sd.invalidate(VirtualAddress::new(0x20_0000), 512).unwrap();

        stop.store(true, Ordering::Release);
        for r in remotes {
            r.join().unwrap();
        }

        let mut flushed: Vec<_> = platform.flushes.lock().unwrap().clone();
        flushed.sort_unstable();
        assert_eq!(
            flushed,
            vec![(0, 0x20_0000, 512), (1, 0x20_0000, 512), (2, 0x20_0000, 512)]
        );
        let mut ipis = platform.ipis.lock().unwrap().clone();
        ipis.sort_unstable();
        assert_eq!(ipis, vec![1, 2]);
    }

    #[test]
    fn wedged_core_times_out_and_request_is_cancelled() {
        let platform = FakePlatform::new();
        let mailbox = ShootdownMailbox::new();
        let sd = Shootdown::new(&mailbox, &platform, CpuMask::first(2), 10_000);

        let err = sd.invalidate(VirtualAddress::new(0x3000), 1).unwrap_err();
        assert_eq!(err, ShootdownError::Timeout { cpu: 1 });

        // the cancelled request must not be executed late
        CPU.with(|c| c.set(1));
        assert!(!mailbox.handle_ipi(1, &platform));
        CPU.with(|c| c.set(0));

        // and the slot is free for the next request
        assert!(mailbox.post(1, VirtualAddress::new(0x4000), 1, 10));
    }
}
