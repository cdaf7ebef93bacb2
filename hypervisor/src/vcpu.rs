//! The module containing [`VCpu`], one hypervisor-visible processor context
//! (C8 glue): the vendor back-end, its second-level paging backend, and the
//! per-vCPU cache and memory-mapping state [`vmexit`](crate::vmexit) drives.

use crate::{
    cache::GuestCacheState,
    global_state::{GlobalState, VCpuId},
    guest_mem::{GuestPhysicalMapper, IdentityMapper},
    hardware_vt::{svm::Svm, vmx::Vmx, HardwareVt},
    paging::{
        gfn_is_mmio,
        nested::{FillDecision, NestedPagingPool},
        shadow::{self, ShadowPageTables},
    },
};
use alloc::boxed::Box;
use log::trace;
use passvisor_core::mmio::MmioRegistry;

/// Number of shadow-page ring-buffer slots; sized the same as
/// [`NestedPagingPool`]'s table pool since both bound the same working set.
const SHADOW_RING_SIZE: usize = 256;

/// The second-level address translation strategy a vCPU was built with:
/// hardware nested paging when the processor advertises it, otherwise the
/// software shadow-paging fallback (see [`crate::paging::shadow`]). Chosen
/// once in [`VCpu::new`] and never switched afterwards.
enum PagingBackend {
    Nested(NestedPagingPool),
    Shadow(ShadowPageTables),
}

/// One vCPU: in this pass-through, 1:1 design, equivalently one physical
/// processor. Owns everything [`crate::vmexit::run_vcpu`] needs to drive
/// the guest through VM-entry/VM-exit rounds.
pub(crate) struct VCpu {
    pub(crate) id: VCpuId,
    pub(crate) vt: Box<dyn HardwareVt>,
    paging: PagingBackend,
    pub(crate) cache: GuestCacheState,
    pub(crate) mapper: IdentityMapper,
}

impl VCpu {
    /// Builds a vCPU for the current processor: selects VT-x or SVM by
    /// vendor, enables hardware VT, and picks a second-level translation
    /// strategy. VT-x always has EPT here - unrestricted guest, required to
    /// run the fixed real-mode MBR entry state, itself requires EPT - so
    /// only SVM ever takes the software shadow-paging fallback, on
    /// processors that lack NPT.
    pub(crate) fn new(id: VCpuId, global: &GlobalState) -> Self {
        let mut vt: Box<dyn HardwareVt> = if is_intel() {
            trace!("vcpu {}: processor is Intel, using VT-x", id.0);
            Box::new(Vmx::new())
        } else {
            trace!("vcpu {}: processor is AMD, using SVM", id.0);
            Box::new(Svm::new())
        };

        vt.enable();

        let paging = if vt.supports_nested_paging() {
            let mut nested = NestedPagingPool::new();
            vt.initialize(Some(nested.root_addr()));
            PagingBackend::Nested(nested)
        } else {
            trace!(
                "vcpu {}: no hardware nested paging, falling back to software shadow paging",
                id.0
            );
            vt.initialize(None);
            PagingBackend::Shadow(ShadowPageTables::new(SHADOW_RING_SIZE))
        };
        vt.load_initial_guest_state(BIOS_BOOT_DRIVE);

        Self {
            id,
            vt,
            paging,
            cache: GuestCacheState::from_host(global.host_cache()),
            mapper: vmm_reserved_mapper(),
        }
    }

    /// Whether this vCPU uses hardware nested paging rather than the
    /// software shadow fallback.
    pub(crate) fn uses_nested_paging(&self) -> bool {
        matches!(self.paging, PagingBackend::Nested(_))
    }

    /// Installs a second-level translation, retrying once after a pool
    /// reset (and the TLB invalidation that demands) if the pool was full.
    /// Returns `false` only if the retry itself fails, which does not
    /// happen in practice since a reset always frees the whole pool.
    pub(crate) fn install_nested_page(&mut self, decision: FillDecision) -> bool {
        let PagingBackend::Nested(nested) = &mut self.paging else {
            unreachable!("install_nested_page called on a shadow-paging vcpu");
        };
        if nested.install(self.vt.as_ref(), decision) {
            return true;
        }
        nested.reset();
        self.vt.invalidate_caches();
        nested.install(self.vt.as_ref(), decision)
    }

    pub(crate) fn nested_root_addr(&mut self) -> u64 {
        let PagingBackend::Nested(nested) = &mut self.paging else {
            unreachable!("nested_root_addr called on a shadow-paging vcpu");
        };
        nested.root_addr()
    }

    /// Handles a `#PF` VM-exit for a shadow-paging vcpu: installs a leaf
    /// GPA==HPA mapping in the shadow tables from the same identity-backed
    /// mapper the nested path fills from. Returns `false` - leaving the
    /// fault for reinjection as a real guest exception - when `gphys` lands
    /// on an MMIO hook (MMIO dispatch is no more built out for the shadow
    /// path than for the nested one; see
    /// `vmexit::handle_nested_page_fault`) or the mapper cannot resolve it.
    pub(crate) fn handle_shadow_page_fault(&mut self, mmio: &MmioRegistry, gphys: u64) -> bool {
        if gfn_is_mmio(mmio, gphys) {
            return false;
        }
        let Self { paging, mapper, .. } = self;
        let PagingBackend::Shadow(tables) = paging else {
            unreachable!("handle_shadow_page_fault called on a nested-paging vcpu");
        };
        shadow::handle_page_fault(tables, gphys, |g| {
            mapper.gp2hp(g).map(|m| (m.host_phys, m.fake_rom))
        })
    }

    /// Re-seats the real hardware `CR3` at the flat shadow root and clears
    /// every existing shadow mapping, mirroring the address-space-wide
    /// invalidation an OS intends by writing `CR3`. No-op on a
    /// nested-paging vcpu, where the guest's own `CR3` value is simply
    /// forwarded to hardware untouched.
    ///
    /// The shadow fallback is a flat guest-physical==host-physical identity
    /// map rather than a mirror of the guest's own page tables, so unlike a
    /// real shadow MMU this never needs to rebuild anything from the new
    /// value itself - only drop the stale translations, which the next
    /// faults lazily repopulate. A guest that enables its own non-identity
    /// paging is not correctly virtualized by this fallback; see DESIGN.md.
    pub(crate) fn invalidate_shadow_on_cr3_write(&mut self) {
        let PagingBackend::Shadow(tables) = &mut self.paging else {
            return;
        };
        tables.clear();
        let root_addr = tables.root_addr();
        self.vt.set_guest_cr(3, root_addr);
    }
}

/// The BIOS boot-drive convention (`DL` at MBR entry): first hard disk.
const BIOS_BOOT_DRIVE: u8 = 0x80;

fn is_intel() -> bool {
    x86::cpuid::CpuId::new().get_vendor_info().unwrap().as_str() == "GenuineIntel"
}

// The VMM reserves the low few megabytes of physical memory for its own
// image, page pools, and per-processor state (everything allocated before
// any vCPU is built). A guest write into that window is treated as a fatal
// "fake ROM" access rather than silently corrupting the VMM; a real
// deployment computes this window from the UEFI memory map instead of a
// fixed constant.
const VMM_RESERVED_BASE: u64 = 0;
const VMM_RESERVED_LEN: u64 = 0x0020_0000;

fn vmm_reserved_mapper() -> IdentityMapper {
    IdentityMapper::new(VMM_RESERVED_BASE, VMM_RESERVED_LEN)
}
