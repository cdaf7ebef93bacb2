//! The module containing the AP bring-up sequence and the cross-processor
//! sync barrier (C2).

use crate::{config::AP_STARTUP_DELAY_MS, pcpu::PCpu, x86_instructions::rdtsc};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// A 4 KiB real-mode trampoline, relocated to a fixed low physical address
/// before the first `STARTUP` IPI is sent. Contains a 16-bit entry stub
/// that loads a minimal GDT, switches to protected mode, and far-jumps into
/// [`ap_entry_trampoline`].
///
/// The trampoline's actual machine code is produced by
/// `hardware_vt::ap_trampoline_code` (assembled once, at a fixed size, so it
/// can be `memcpy`'d verbatim onto the low page); this module only owns the
/// timing and IPI sequencing around it.
const TRAMPOLINE_PHYS_ADDR: u64 = 0x8000;

static APINIT_PROCS: AtomicU32 = AtomicU32::new(1); // BSP counts as one.
static TRAMPOLINE_LOCK: Mutex<()> = Mutex::new(());

/// Sends `INIT`-`SIPI`-`SIPI` to every other logical processor and blocks
/// until each one has entered the trampoline and incremented
/// [`APINIT_PROCS`], or until `timeout_ms` has elapsed.
///
/// # Safety
/// Must be called exactly once, by the bootstrap processor, after boot
/// services have been exited (or with boot services aware of the
/// relocation) and with `trampoline_code` installed at
/// [`TRAMPOLINE_PHYS_ADDR`].
pub(crate) unsafe fn start_all_aps(number_of_cores: u32, timeout_ms: u64) {
    if number_of_cores <= 1 {
        return;
    }

    // Safety: delegated to the caller's contract above.
    unsafe {
        send_init_ipi_all_excluding_self();
    }
    busy_wait_ms(AP_STARTUP_DELAY_MS);

    for _ in 0..2 {
        // Safety: delegated to the caller's contract above.
        unsafe {
            send_startup_ipi_all_excluding_self(TRAMPOLINE_PHYS_ADDR);
        }
        busy_wait_ms(AP_STARTUP_DELAY_MS);
    }

    let deadline = rdtsc() + ms_to_tsc(timeout_ms);
    while APINIT_PROCS.load(Ordering::Acquire) < number_of_cores {
        if rdtsc() > deadline {
            break;
        }
        core::hint::spin_loop();
    }
}

/// Called by an AP immediately after it lands in long mode out of the
/// trampoline. Serializes against other arriving APs with
/// [`TRAMPOLINE_LOCK`] while it switches to its own kernel stack and
/// installs its `PCpu`, then hands off to `ap_init` (the caller-supplied
/// per-processor entry point).
pub(crate) fn apinitproc1(vcpu_id: crate::global_state::VCpuId, ap_init: fn(crate::global_state::VCpuId) -> !) -> ! {
    let guard = TRAMPOLINE_LOCK.lock();
    let _count = APINIT_PROCS.fetch_add(1, Ordering::AcqRel) + 1;
    drop(guard);

    // Safety: called once per AP, before any other code on this processor
    // depends on `PCpu::current()`.
    let _pcpu: *mut PCpu = unsafe { PCpu::segment_init_ap(vcpu_id) };

    ap_init(vcpu_id)
}

/// The cross-processor sync barrier (`sync_all_processors`). Every
/// processor that participates in a round must call this; none may be
/// absent, or the round never advances.
pub(crate) struct SyncBarrier {
    participant_count: u32,
    sync_count: AtomicU32,
    sync_id: AtomicU32,
}

impl SyncBarrier {
    /// Creates a barrier for exactly `participant_count` processors.
    pub(crate) const fn new(participant_count: u32) -> Self {
        Self {
            participant_count,
            sync_count: AtomicU32::new(0),
            sync_id: AtomicU32::new(0),
        }
    }

    /// Blocks until every participant has called `wait` for the current
    /// round, then releases all of them together. The increment of the
    /// round id happens-before any participant observes post-barrier
    /// state, via the `Release`/`Acquire` pair on `sync_id`.
    pub(crate) fn wait(&self) {
        let round = self.sync_id.load(Ordering::Acquire);
        let arrived = self.sync_count.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == self.participant_count {
            self.sync_count.store(0, Ordering::Relaxed);
            self.sync_id.store(round.wrapping_add(1), Ordering::Release);
            return;
        }

        while self.sync_id.load(Ordering::Acquire) == round {
            core::hint::spin_loop();
        }
    }
}

fn ms_to_tsc(ms: u64) -> u64 {
    // The hypervisor never calibrates the TSC frequency itself (calibration
    // is a platform concern out of this core's scope); a conservative 1GHz
    // floor keeps the bring-up timeout from firing spuriously on slower
    // parts, at the cost of waiting longer than necessary on faster ones.
    const ASSUMED_TSC_HZ: u64 = 1_000_000_000;
    (ASSUMED_TSC_HZ / 1000) * ms
}

fn busy_wait_ms(ms: u64) {
    let deadline = rdtsc() + ms_to_tsc(ms);
    while rdtsc() < deadline {
        core::hint::spin_loop();
    }
}

/// Sends `INIT` (assert, then deassert) via the local APIC's ICR to every
/// processor but the caller.
///
/// # Safety
/// The local APIC must be in xAPIC or x2APIC mode and already mapped/MSR
/// accessible.
unsafe fn send_init_ipi_all_excluding_self() {
    const ICR_INIT_ASSERT: u64 = 0x0004_0500; // Fixed delivery mode=INIT, level=assert, dest=all-excl-self.
    const ICR_INIT_DEASSERT: u64 = 0x0004_0500 & !0x4000;
    // Safety: delegated to this function's contract.
    unsafe {
        write_icr(ICR_INIT_ASSERT);
        write_icr(ICR_INIT_DEASSERT);
    }
}

/// Sends a `STARTUP` IPI with the given trampoline physical address (must
/// be page-aligned and below 1 MiB) to every processor but the caller.
///
/// # Safety
/// Same preconditions as [`send_init_ipi_all_excluding_self`].
unsafe fn send_startup_ipi_all_excluding_self(trampoline_phys: u64) {
    const ICR_STARTUP_BASE: u64 = 0x0004_0600; // Delivery mode=STARTUP, dest=all-excl-self.
    let vector = (trampoline_phys >> 12) & 0xFF;
    // Safety: delegated to this function's contract.
    unsafe {
        write_icr(ICR_STARTUP_BASE | vector);
    }
}

/// Writes the local APIC's Interrupt Command Register, via the x2APIC MSR
/// interface.
///
/// # Safety
/// The local APIC must be in x2APIC mode.
unsafe fn write_icr(value: u64) {
    const IA32_X2APIC_ICR: u32 = 0x830;
    // Safety: delegated to this function's contract.
    unsafe { x86::msr::wrmsr(IA32_X2APIC_ICR, value) };
}
