//! The module containing the cache-attribute emulator (C3): virtualizes
//! MTRRs and PAT and computes the effective memory type for a guest
//! physical address.
//!
//! The type-combination algebra itself ([`passvisor_core::cache`]) is
//! hardware-independent and lives in the core logic crate; this module owns
//! the MSR-facing half: reading/writing the real MTRR/PAT MSRs, snapshotting
//! them once at init, and the host MTRR/PAT reprogramming sequence that
//! guest PAT writes must trigger on every processor.

use crate::{smp::SyncBarrier, x86_instructions};
use passvisor_core::cache::{combine, pat_index, CacheType, PAT_DEFAULT};
use x86::msr;

const NUM_MTRR_FIX: usize = 11;
const MTRR_VCNT_MAX: usize = 8;

const MTRR_FIX_MSRS: [u32; NUM_MTRR_FIX] = [
    msr::IA32_MTRR_FIX64K_00000,
    msr::IA32_MTRR_FIX16K_80000,
    msr::IA32_MTRR_FIX16K_A0000,
    msr::IA32_MTRR_FIX4K_C0000,
    msr::IA32_MTRR_FIX4K_C8000,
    msr::IA32_MTRR_FIX4K_D0000,
    msr::IA32_MTRR_FIX4K_D8000,
    msr::IA32_MTRR_FIX4K_E0000,
    msr::IA32_MTRR_FIX4K_E8000,
    msr::IA32_MTRR_FIX4K_F0000,
    msr::IA32_MTRR_FIX4K_F8000,
];

const MTRR_DEF_TYPE_ENABLE: u64 = 1 << 11;
const MTRR_DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;
const MTRR_PHYSMASK_VALID: u64 = 1 << 11;

/// A snapshot of the real, host-side MTRR/PAT configuration, taken once
/// during boot. Restoring this (rather than re-deriving it) is what lets
/// [`reprogram_host_mtrr_and_pat`] run the same values back in after the
/// disable/WBINVD/reload dance.
#[derive(Clone, Copy)]
pub(crate) struct HostCacheSnapshot {
    mtrr_def_type: u64,
    mtrr_fix: [u64; NUM_MTRR_FIX],
    mtrr_physbase: [u64; MTRR_VCNT_MAX],
    mtrr_physmask: [u64; MTRR_VCNT_MAX],
    pat: u64,
    has_pat: bool,
}

impl HostCacheSnapshot {
    /// Reads every MTRR/PAT MSR this processor exposes. Must be called
    /// before any guest runs, while still executing with the host's
    /// original cache configuration.
    pub(crate) fn capture() -> Self {
        let has_pat = has_pat_support();
        Self {
            mtrr_def_type: x86_instructions::rdmsr(msr::IA32_MTRR_DEF_TYPE),
            mtrr_fix: MTRR_FIX_MSRS.map(x86_instructions::rdmsr),
            mtrr_physbase: core::array::from_fn(|i| {
                x86_instructions::rdmsr(msr::IA32_MTRR_PHYSBASE0 + i as u32 * 2)
            }),
            mtrr_physmask: core::array::from_fn(|i| {
                x86_instructions::rdmsr(msr::IA32_MTRR_PHYSMASK0 + i as u32 * 2)
            }),
            pat: if has_pat {
                x86_instructions::rdmsr(msr::IA32_PAT)
            } else {
                default_pat_value()
            },
            has_pat,
        }
    }

    /// The synthetic `MTRRCAP` value exposed to the guest: fixed-range
    /// support plus [`MTRR_VCNT_MAX`] variable ranges, and the
    /// write-combining bit iff the host itself supports it.
    pub(crate) fn guest_mtrrcap(&self) -> u64 {
        const MTRRCAP_FIXED_SUPPORTED: u64 = 1 << 8;
        const MTRRCAP_WC_SUPPORTED: u64 = 1 << 10;
        let mut cap = MTRR_VCNT_MAX as u64 | MTRRCAP_FIXED_SUPPORTED;
        if self.has_pat {
            cap |= MTRRCAP_WC_SUPPORTED;
        }
        cap
    }

    pub(crate) const fn has_pat(&self) -> bool {
        self.has_pat
    }
}

fn has_pat_support() -> bool {
    const CPUID_FEAT_EDX_PAT: u32 = 1 << 16;
    // Safety: CPUID leaf 1 is always available.
    let result = unsafe { core::arch::x86_64::__cpuid(1) };
    result.edx & CPUID_FEAT_EDX_PAT != 0
}

fn default_pat_value() -> u64 {
    PAT_DEFAULT
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, ty)| acc | (u64::from(ty.to_raw()) << (i * 8)))
}

/// Guest-visible MTRR/PAT state. One instance per vCPU; mutated on guest MSR
/// writes and consulted on every guest-physical cache-type lookup.
pub(crate) struct GuestCacheState {
    mtrr_def_type: u64,
    mtrr_fix: [u64; NUM_MTRR_FIX],
    mtrr_physbase: [u64; MTRR_VCNT_MAX],
    mtrr_physmask: [u64; MTRR_VCNT_MAX],
    pat: u64,
}

impl GuestCacheState {
    /// Seeds guest-visible state from the host snapshot, matching how a
    /// freshly reset processor inherits BIOS-programmed MTRRs until the
    /// guest OS reprograms them.
    pub(crate) fn from_host(host: &HostCacheSnapshot) -> Self {
        Self {
            mtrr_def_type: host.mtrr_def_type,
            mtrr_fix: host.mtrr_fix,
            mtrr_physbase: host.mtrr_physbase,
            mtrr_physmask: host.mtrr_physmask,
            pat: host.pat,
        }
    }

    /// Validates and installs a new guest PAT value. Rejects (returns
    /// `false`, which the caller should turn into a guest `#GP`) any byte
    /// that does not decode to one of the six representable memory types.
    pub(crate) fn set_pat(&mut self, value: u64) -> bool {
        for i in 0..8 {
            let byte = (value >> (i * 8)) as u8;
            if CacheType::from_raw(byte).is_none() {
                return false;
            }
        }
        self.pat = value;
        true
    }

    pub(crate) const fn pat(&self) -> u64 {
        self.pat
    }

    pub(crate) fn set_mtrr_def_type(&mut self, value: u64) {
        self.mtrr_def_type = value;
    }

    pub(crate) const fn mtrr_def_type(&self) -> u64 {
        self.mtrr_def_type
    }

    pub(crate) fn set_variable_mtrr_base(&mut self, index: usize, value: u64) {
        self.mtrr_physbase[index] = value;
    }

    pub(crate) fn set_variable_mtrr_mask(&mut self, index: usize, value: u64) {
        self.mtrr_physmask[index] = value;
    }

    /// Computes the effective MTRR type for `phys`, per `get_mtrr_type`:
    /// honors the enable bit, the fixed-range window, then the variable
    /// ranges (first `UC` wins, `WT` masks everything but `UC`, `WB` yields
    /// to `WT`), falling back to the default type.
    pub(crate) fn mtrr_type(&self, phys: u64, pass_fixed: bool) -> CacheType {
        if self.mtrr_def_type & MTRR_DEF_TYPE_ENABLE == 0 {
            return CacheType::Uc;
        }
        if self.mtrr_def_type & MTRR_DEF_TYPE_FIXED_ENABLE != 0 && phys <= 0xFFFFF {
            if pass_fixed {
                return CacheType::Wb;
            }
            return self.fixed_mtrr_type(phys);
        }

        let mut result: Option<CacheType> = None;
        for i in 0..MTRR_VCNT_MAX {
            let mask = self.mtrr_physmask[i];
            if mask & MTRR_PHYSMASK_VALID == 0 {
                continue;
            }
            let phys_mask = mask & !0xFFF;
            let base = self.mtrr_physbase[i];
            if (base & phys_mask) != (phys & phys_mask) {
                continue;
            }
            let Some(base_type) = CacheType::from_raw((base & 0xFF) as u8) else {
                continue;
            };
            result = Some(match (result, base_type) {
                (_, CacheType::Uc) => return CacheType::Uc,
                (_, CacheType::Wt) => CacheType::Wt,
                (Some(CacheType::Wt), _) => CacheType::Wt,
                (None, other) => other,
                (Some(existing), _) => existing,
            });
        }
        result.unwrap_or_else(|| {
            CacheType::from_raw((self.mtrr_def_type & 0xFF) as u8).unwrap_or(CacheType::Uc)
        })
    }

    fn fixed_mtrr_type(&self, phys: u64) -> CacheType {
        let index = if phys & 0x80000 != 0 {
            if phys & 0x40000 != 0 {
                ((phys & 0x3F000) >> 12) as usize
            } else {
                64 + ((phys & 0x3C000) >> 14) as usize
            }
        } else {
            80 + ((phys & 0x70000) >> 16) as usize
        };
        let msr_index = index / 8;
        let byte_index = index % 8;
        let byte = (self.mtrr_fix[msr_index] >> (byte_index * 8)) as u8;
        CacheType::from_raw(byte).unwrap_or(CacheType::Uc)
    }

    /// Returns true iff every address in `[phys & !mask, phys | mask]`
    /// shares the same effective MTRR type, used to decide whether a
    /// large-page mapping may be installed.
    pub(crate) fn type_is_uniform_over(&self, phys: u64, mask: u64, pass_fixed: bool) -> bool {
        let base_type = self.mtrr_type(phys & !mask, pass_fixed);
        let step = 0x1000u64;
        let mut addr = phys & !mask;
        let end = phys | mask;
        while addr < end {
            if self.mtrr_type(addr, pass_fixed) != base_type {
                return false;
            }
            addr += step;
        }
        true
    }

    /// The effective memory type for a guest-physical access carrying the
    /// given PTE cache bits, combining PAT and MTRR per `get_type`.
    pub(crate) fn effective_type(&self, gphys: u64, pat_bit: bool, pcd_bit: bool, pwt_bit: bool) -> CacheType {
        let index = pat_index(pat_bit, pcd_bit, pwt_bit);
        let pat_type = CacheType::from_raw((self.pat >> (index * 8)) as u8).unwrap_or(CacheType::Uc);
        if matches!(pat_type, CacheType::Uc | CacheType::Wc) {
            return pat_type;
        }
        let mtrr_type = self.mtrr_type(gphys, false);
        combine(pat_type, mtrr_type)
    }
}

/// Runs the host MTRR/PAT reprogramming sequence (`update_mtrr_and_pat`) on
/// this processor, synchronized against every other processor by
/// `barrier`. Must be invoked identically, at the same logical point, on
/// every processor: the disable/WBINVD/reload dance is only safe if no
/// processor observes a half-updated configuration from another.
pub(crate) fn reprogram_host_mtrr_and_pat(barrier: &SyncBarrier, snapshot: &HostCacheSnapshot) {
    barrier.wait();

    let mut cr0 = x86_instructions::cr0();
    cr0.insert(x86::controlregs::Cr0::CD);
    cr0.remove(x86::controlregs::Cr0::NW);
    x86_instructions::cr0_write(cr0);
    x86_instructions::wbinvd();

    let mut cr4 = x86_instructions::cr4();
    let pge_was_set = cr4.contains(x86::controlregs::Cr4::CR4_ENABLE_GLOBAL_PAGES);
    cr4.remove(x86::controlregs::Cr4::CR4_ENABLE_GLOBAL_PAGES);
    x86_instructions::cr4_write(cr4);
    x86_instructions::flush_tlb();

    x86_instructions::wrmsr(msr::IA32_MTRR_DEF_TYPE, snapshot.mtrr_def_type & !MTRR_DEF_TYPE_ENABLE);

    for (msr_id, value) in MTRR_FIX_MSRS.iter().zip(snapshot.mtrr_fix) {
        x86_instructions::wrmsr(*msr_id, value);
    }
    for i in 0..MTRR_VCNT_MAX {
        x86_instructions::wrmsr(msr::IA32_MTRR_PHYSBASE0 + i as u32 * 2, snapshot.mtrr_physbase[i]);
        x86_instructions::wrmsr(msr::IA32_MTRR_PHYSMASK0 + i as u32 * 2, snapshot.mtrr_physmask[i]);
    }
    if snapshot.has_pat {
        x86_instructions::wrmsr(msr::IA32_PAT, snapshot.pat);
    }

    x86_instructions::wrmsr(msr::IA32_MTRR_DEF_TYPE, snapshot.mtrr_def_type);

    x86_instructions::wbinvd();
    x86_instructions::flush_tlb();

    cr0 = x86_instructions::cr0();
    cr0.remove(x86::controlregs::Cr0::CD);
    x86_instructions::cr0_write(cr0);

    if pge_was_set {
        let mut cr4 = x86_instructions::cr4();
        cr4.insert(x86::controlregs::Cr4::CR4_ENABLE_GLOBAL_PAGES);
        x86_instructions::cr4_write(cr4);
    }

    barrier.wait();
}
