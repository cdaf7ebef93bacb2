//! Software shadow page tables (SPT_2): used on hardware that lacks nested
//! paging, or while the vCPU is in real mode / has paging disabled.
//!
//! The ring-buffer slot bookkeeping, RW-map, and leaf-PTE bit packing are
//! pure and live in [`passvisor_core::shadow`]; this module owns the real
//! page-sized table memory the ring buffer indexes into and the CR3-root
//! walk that reaches a shadow1/shadow2 page's parent entry.

use alloc::boxed::Box;
pub(crate) use passvisor_core::shadow::{
    downgrade_other_vcpus, pack_leaf_pte, RwMap, ShadowLeafFlags, ShadowLookup, ShadowSlotIndex,
};
use passvisor_core::pagewalk::ShadowKey;
use x86::current::paging::BASE_PAGE_SHIFT;

/// Installs a leaf mapping for a shadow-page-table fault at `gphys`,
/// analogous to `nested::decide_fill` but writing directly into a real,
/// hardware-walked page table instead of an EPT/NPT structure. The shadow
/// fallback only ever maps guest-physical==host-physical (flat identity),
/// so `host_phys_of` is expected to be the same identity mapper the nested
/// path fills from; this only differs in where the resulting translation
/// lives. Returns `false` if `host_phys_of` cannot resolve `gphys`.
pub(crate) fn handle_page_fault(
    tables: &mut ShadowPageTables,
    gphys: u64,
    host_phys_of: impl Fn(u64) -> Option<(u64, bool)>,
) -> bool {
    let page = gphys & !0xFFF;
    let Some((host_phys, fake_rom)) = host_phys_of(page) else {
        return false;
    };
    let flags = ShadowLeafFlags {
        writable: !fake_rom,
        user: true,
        no_execute: false,
        pat_bit: false,
        pcd_bit: false,
        pwt_bit: false,
    };
    let entry = seek_leaf_entry(tables, page, |_level, index| ShadowKey::new(index, true, 1, false));
    *entry = pack_leaf_pte(host_phys, flags);
    true
}

/// A page-sized table slot, reused by [`ShadowSlotIndex`]'s ring buffer
/// once its generation is stale. Holds either a CR3-level root page, a
/// shadow2 (page-directory) page, or a shadow1 (page-table) page.
#[repr(C, align(4096))]
struct ShadowPage {
    entries: [u64; 512],
}
const _: () = assert!(core::mem::size_of::<ShadowPage>() == 1 << BASE_PAGE_SHIFT);

/// The shadow CR3 root table plus its ring-buffer-backed interior pages.
pub(crate) struct ShadowPageTables {
    root: Box<ShadowPage>,
    ring: Box<[ShadowPage]>,
    index: ShadowSlotIndex,
}

impl ShadowPageTables {
    pub(crate) fn new(ring_size: usize) -> Self {
        Self {
            root: unsafe { Box::<ShadowPage>::new_zeroed().assume_init() },
            ring: unsafe { Box::<[ShadowPage]>::new_zeroed_slice(ring_size).assume_init() },
            index: ShadowSlotIndex::new(ring_size),
        }
    }

    pub(crate) fn root_addr(&mut self) -> u64 {
        core::ptr::addr_of_mut!(*self.root) as u64
    }

    /// Returns the shadow page backing `key`, allocating from the ring as
    /// needed. The caller must zero the slot itself when the lookup is not
    /// [`ShadowLookup::FoundNormal`] - the contents are stale otherwise.
    pub(crate) fn slot_for(&mut self, key: ShadowKey) -> (&mut ShadowPage, ShadowLookup) {
        let (slot, lookup) = self.index.lookup_or_allocate(key);
        if !matches!(lookup, ShadowLookup::FoundNormal) {
            self.ring[slot].entries = [0u64; 512];
        }
        (&mut self.ring[slot], lookup)
    }

    /// Clears the CR3-root table and the ring index, without freeing any
    /// memory - the next fault simply rebuilds from the empty state. Used
    /// both for pool exhaustion and for `MOV CR3`.
    pub(crate) fn clear(&mut self) {
        self.root.entries = [0u64; 512];
        self.index.clear();
    }
}

impl ShadowPage {
    fn entry_mut(&mut self, index: usize) -> &mut u64 {
        &mut self.entries[index]
    }
}

/// Seeks the shadow page-directory entry for `linear`'s top two indices,
/// allocating ring-buffer pages as needed, and returns a pointer to the
/// leaf entry slot for the bottom index. `key_for` derives the
/// [`ShadowKey`] for a given level and index pair from whatever context
/// (guest paging levels, large-page-ness) the caller already resolved.
pub(crate) fn seek_leaf_entry<'a>(
    tables: &'a mut ShadowPageTables,
    linear: u64,
    key_for: impl Fn(u8, u64) -> ShadowKey,
) -> &'a mut u64 {
    let pdi = (linear >> 21) & 0x1FF;
    let pti = (linear >> 12) & 0x1FF;

    let root_slot_addr = tables.root_addr();
    let root_entry = unsafe { &mut *(root_slot_addr as *mut u64).add(pdi as usize) };

    if *root_entry & 1 == 0 {
        let key = key_for(2, linear >> 21);
        let (page, _) = tables.slot_for(key);
        let page_addr = core::ptr::addr_of_mut!(*page) as u64;
        *root_entry = page_addr | 1;
    }

    let shadow1_addr = *root_entry & !0xFFF;
    // Safety: `shadow1_addr` was just derived from a ring-buffer slot this
    // same call either found or allocated.
    let shadow1 = unsafe { &mut *(shadow1_addr as *mut ShadowPage) };
    shadow1.entry_mut(pti as usize)
}
