//! Hardware nested paging (EPT on VT-x, NPT on SVM): the fault handler and
//! the backing table pool.

use super::FaultContext;
use crate::hardware_vt::{
    HardwareVt, NestedPagingStructure, NestedPagingStructureEntry, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType,
};
use alloc::boxed::Box;
use core::ptr::addr_of_mut;
use passvisor_core::pagewalk::{choose_page_size, PageSize};
use x86::current::paging::BASE_PAGE_SHIFT;

/// The number of preallocated tables backing PML4/PDPT/PD/PT levels beyond
/// the root, not counting the root itself.
const POOL_SIZE: usize = 256;

/// Guest physical and host physical address pair the fault handler resolved
/// for a nested-paging fill, along with the page size actually installed
/// (the fault may be satisfied with a larger mapping than the faulting
/// access alone would require).
#[derive(Clone, Copy, Debug)]
pub(crate) struct FillDecision {
    pub(crate) gphys_aligned: u64,
    pub(crate) host_phys_aligned: u64,
    pub(crate) size: PageSize,
    pub(crate) writable: bool,
}

/// The nested-paging table pool: a root plus up to [`POOL_SIZE`] interior
/// tables, handed out by a monotonically growing free counter. When the
/// pool is exhausted the whole structure is reset and a TLB invalidation
/// is broadcast by the caller, rather than growing further - the pool size
/// is a fixed budget by design.
pub(crate) struct NestedPagingPool {
    root: Box<NestedPagingStructure>,
    tables: Box<[NestedPagingStructure]>,
    used: usize,
}

impl NestedPagingPool {
    pub(crate) fn new() -> Self {
        Self {
            root: unsafe { Box::<NestedPagingStructure>::new_zeroed().assume_init() },
            tables: unsafe {
                Box::<[NestedPagingStructure]>::new_zeroed_slice(POOL_SIZE).assume_init()
            },
            used: 0,
        }
    }

    pub(crate) fn root_addr(&mut self) -> u64 {
        addr_of_mut!(*self.root) as u64
    }

    /// Clears the root and free counter, returning every table to the pool.
    /// The caller is responsible for the `INVEPT`/TLB-flush broadcast this
    /// implies.
    pub(crate) fn reset(&mut self) {
        for entry in &mut self.root.entries {
            *entry = NestedPagingStructureEntry::default();
        }
        self.used = 0;
    }

    fn take_table(&mut self) -> Option<u64> {
        if self.used >= self.tables.len() {
            return None;
        }
        let addr = addr_of_mut!(self.tables[self.used]) as u64;
        self.used += 1;
        Some(addr)
    }

    /// Walks from the root down to the table at `size`'s level, allocating
    /// interior tables from the pool as needed, and installs a leaf
    /// translation there. Returns `false` (and leaves the pool untouched
    /// past whatever tables it already allocated along the path) if the
    /// pool ran out partway through the walk; the caller resets and
    /// retries.
    #[allow(clippy::similar_names)]
    pub(crate) fn install(
        &mut self,
        vt: &dyn HardwareVt,
        decision: FillDecision,
    ) -> bool {
        let gpa = decision.gphys_aligned as usize;
        let pml4i = (gpa >> 39) & 0x1FF;
        let pdpti = (gpa >> 30) & 0x1FF;
        let pdi = (gpa >> 21) & 0x1FF;
        let pti = (gpa >> 12) & 0x1FF;

        let Some(pml4e) = Self::descend(&mut self.root, pml4i, &mut self.used, &mut self.tables)
        else {
            return false;
        };
        if decision.size == PageSize::Size1G {
            Self::set_leaf(pml4e, vt, decision);
            return true;
        }
        let pdpt = pml4e.next_table_mut();
        let Some(pdpte) = Self::descend(pdpt, pdpti, &mut self.used, &mut self.tables) else {
            return false;
        };
        if decision.size == PageSize::Size2M {
            Self::set_leaf(pdpte, vt, decision);
            return true;
        }
        let pd = pdpte.next_table_mut();
        let Some(pde) = Self::descend(pd, pdi, &mut self.used, &mut self.tables) else {
            return false;
        };
        let pt = pde.next_table_mut();
        let pte = &mut pt.entries[pti];
        Self::set_leaf(pte, vt, decision);
        true
    }

    fn descend<'a>(
        table: &'a mut NestedPagingStructure,
        index: usize,
        used: &mut usize,
        pool: &mut [NestedPagingStructure],
    ) -> Option<&'a mut NestedPagingStructureEntry> {
        let entry = &mut table.entries[index];
        if entry.pfn() == 0 {
            if *used >= pool.len() {
                return None;
            }
            let next_table = addr_of_mut!(pool[*used]) as u64;
            *used += 1;
            entry.set_translation(
                next_table,
                NestedPagingStructureEntryFlags {
                    permission: 0b111,
                    memory_type: 0,
                },
            );
        }
        Some(entry)
    }

    fn set_leaf(entry: &mut NestedPagingStructureEntry, vt: &dyn HardwareVt, decision: FillDecision) {
        let kind = if decision.writable {
            NestedPagingStructureEntryType::RwxWriteBack
        } else {
            NestedPagingStructureEntryType::RxWriteBack
        };
        entry.set_translation(decision.host_phys_aligned, vt.nps_entry_flags(kind));
    }
}

/// The `vt_ept_violation` / `svm_np_pagefault` contract: resolves the page
/// size and attributes a second-level fault should be filled with, given
/// the faulting guest-physical address and the write/missing-translation
/// qualification the hardware reported.
///
/// MMIO gfns never reach this far: [`super::gfn_is_mmio`] is checked by the
/// caller first, so this function only decides the mapping for real guest
/// memory.
pub(crate) fn decide_fill(
    ctx: &FaultContext<'_>,
    gphys: u64,
    host_phys_of: impl Fn(u64) -> Option<(u64, bool)>,
    host_supports_1g: bool,
) -> Option<FillDecision> {
    let (host_phys, fake_rom) = host_phys_of(gphys)?;

    let mmio = ctx.mmio;
    let cache = ctx.cache;

    let size = choose_page_size(
        gphys,
        |_| true,
        |size| size != PageSize::Size1G || host_supports_1g,
        |start, len| mmio.buckets_overlap(start, len),
        |start, len| {
            let Some((base, _)) = host_phys_of(start) else {
                return false;
            };
            (0..len)
                .step_by(0x1000)
                .all(|off| host_phys_of(start + off).map(|(hp, _)| hp) == Some(base + off))
        },
        |start, len| cache.type_is_uniform_over(start, len.wrapping_sub(1), true),
    );

    Some(FillDecision {
        gphys_aligned: gphys & size.align_mask(),
        host_phys_aligned: host_phys & size.align_mask(),
        size,
        writable: !fake_rom,
    })
}
