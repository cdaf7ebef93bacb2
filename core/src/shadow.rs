//! The pure bookkeeping half of the SPT_2 shadow-page-table engine: the
//! ring-buffer shadow-page pool indexed by [`crate::pagewalk::ShadowKey`],
//! the leaf-PTE bit packing, and the cross-vCPU RW-map downgrade rule.
//!
//! None of this touches a real CR3 table or guest memory - the `hypervisor`
//! binary crate's `paging::shadow` module owns walking the real shadow
//! tables; this module only owns which slot a key maps to and what bits a
//! leaf PTE should carry.

use crate::pagewalk::ShadowKey;
use alloc::{collections::BTreeMap, vec, vec::Vec};
use spin::Mutex;

/// Which half of the ring buffer a lookup found a shadow page in - kept
/// purely for the diagnostic counters the fault handler reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShadowLookup {
    /// The slot was reused from a different, now-evicted key.
    FoundModified,
    /// The key was already resident.
    FoundNormal,
    /// The slot had never held a key before.
    Allocated,
}

/// The ring-buffer shadow-page index: tracks which slot (0..`ring_size`)
/// holds which [`ShadowKey`], without owning the page memory itself - the
/// binary crate keeps the actual page-sized buffers and indexes them by
/// the slot number this type hands back.
pub struct ShadowSlotIndex {
    ring_size: usize,
    cursor: usize,
    key_to_slot: BTreeMap<u64, usize>,
    slot_to_key: Vec<Option<u64>>,
    found_modified: u64,
    found_normal: u64,
    allocated: u64,
}

impl ShadowSlotIndex {
    /// Builds an index over a ring of `ring_size` slots. Panics if
    /// `ring_size` is zero - the fault handler always sizes this from a
    /// non-empty preallocated buffer.
    #[must_use]
    pub fn new(ring_size: usize) -> Self {
        assert!(ring_size > 0, "shadow ring must have at least one slot");
        Self {
            ring_size,
            cursor: 0,
            key_to_slot: BTreeMap::new(),
            slot_to_key: vec![None; ring_size],
            found_modified: 0,
            found_normal: 0,
            allocated: 0,
        }
    }

    /// Looks up the slot for `key`, allocating one from the ring if absent.
    /// Returns the slot index and which path was taken; the caller is
    /// responsible for zeroing the slot's backing page whenever the
    /// returned lookup is not [`ShadowLookup::FoundNormal`].
    pub fn lookup_or_allocate(&mut self, key: ShadowKey) -> (usize, ShadowLookup) {
        if let Some(&slot) = self.key_to_slot.get(&key.raw()) {
            self.found_normal += 1;
            return (slot, ShadowLookup::FoundNormal);
        }

        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.ring_size;

        let lookup = if let Some(old_key) = self.slot_to_key[slot].take() {
            let _ = self.key_to_slot.remove(&old_key);
            self.found_modified += 1;
            ShadowLookup::FoundModified
        } else {
            self.allocated += 1;
            ShadowLookup::Allocated
        };

        self.slot_to_key[slot] = Some(key.raw());
        let _ = self.key_to_slot.insert(key.raw(), slot);
        (slot, lookup)
    }

    /// Drops every tracked key, returning every slot to the free state.
    pub fn clear(&mut self) {
        self.key_to_slot.clear();
        self.slot_to_key.fill(None);
        self.cursor = 0;
    }

    /// `(found_modified, found_normal, allocated)` counters since the last
    /// [`Self::clear`].
    #[must_use]
    pub const fn counters(&self) -> (u64, u64, u64) {
        (self.found_modified, self.found_normal, self.allocated)
    }
}

/// The permission bits a shadow leaf PTE is installed with, already
/// combined from the guest's page-table chain and the cache-attribute
/// emulator's PAT/PCD/PWT triple.
#[derive(Clone, Copy, Debug)]
pub struct ShadowLeafFlags {
    /// Read/write. Cleared when the frame is a target of [`ShadowSlotIndex`]
    /// tracking elsewhere, or the mapper reported a fake-ROM page.
    pub writable: bool,
    /// User/supervisor.
    pub user: bool,
    /// NX bit.
    pub no_execute: bool,
    pub pat_bit: bool,
    pub pcd_bit: bool,
    pub pwt_bit: bool,
}

/// Packs [`ShadowLeafFlags`] and a host-physical frame into a raw leaf-PTE
/// value, in the standard x86 bit layout.
#[must_use]
pub const fn pack_leaf_pte(host_phys: u64, flags: ShadowLeafFlags) -> u64 {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const PWT: u64 = 1 << 3;
    const PCD: u64 = 1 << 4;
    const PAT: u64 = 1 << 7;
    const NO_EXECUTE: u64 = 1 << 63;

    let mut pte = (host_phys & !0xFFF) | PRESENT;
    if flags.writable {
        pte |= WRITABLE;
    }
    if flags.user {
        pte |= USER;
    }
    if flags.pwt_bit {
        pte |= PWT;
    }
    if flags.pcd_bit {
        pte |= PCD;
    }
    if flags.pat_bit {
        pte |= PAT;
    }
    if flags.no_execute {
        pte |= NO_EXECUTE;
    }
    pte
}

/// One vCPU's RW-map: which guest frames currently have a writable shadow
/// PTE pointing at them. Consulted under its own spinlock by the
/// cross-vCPU downgrade pass, always taken in ascending-vCPU-id order to
/// avoid deadlock against a concurrent downgrade originating elsewhere.
pub struct RwMap {
    inner: Mutex<BTreeMap<u64, ()>>,
}

impl RwMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mark_writable(&self, gfn: u64) {
        let _ = self.inner.lock().insert(gfn, ());
    }

    /// Downgrades this vCPU's writable mapping of `gfn`, if any, returning
    /// whether one was present. The caller clears the RW bit in the
    /// corresponding shadow PTE; this map only tracks membership.
    pub fn downgrade(&self, gfn: u64) -> bool {
        self.inner.lock().remove(&gfn).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for RwMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the cross-vCPU coordination rule: when `gfn` is about to become
/// the target of a writable shadow PTE on `installing_vcpu`, every other
/// vCPU's RW-map is scanned in ascending vCPU-id order and its writable
/// mapping of `gfn`, if present, is downgraded via `downgrade_pte`.
pub fn downgrade_other_vcpus(
    rw_maps: &[(u32, &RwMap)],
    installing_vcpu: u32,
    gfn: u64,
    mut downgrade_pte: impl FnMut(u32, u64),
) {
    let mut ordered: Vec<_> = rw_maps.iter().collect();
    ordered.sort_by_key(|(id, _)| *id);
    for (id, map) in ordered {
        if *id == installing_vcpu {
            continue;
        }
        if map.downgrade(gfn) {
            downgrade_pte(*id, gfn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{downgrade_other_vcpus, pack_leaf_pte, RwMap, ShadowLeafFlags, ShadowLookup, ShadowSlotIndex};
    use crate::pagewalk::ShadowKey;
    use alloc::vec;

    #[test]
    fn first_lookup_of_a_key_allocates() {
        let mut index = ShadowSlotIndex::new(4);
        let key = ShadowKey::new(1, false, 4, false);
        let (_, lookup) = index.lookup_or_allocate(key);
        assert_eq!(lookup, ShadowLookup::Allocated);
        assert_eq!(index.counters(), (0, 0, 1));
    }

    #[test]
    fn second_lookup_of_same_key_is_found_normal() {
        let mut index = ShadowSlotIndex::new(4);
        let key = ShadowKey::new(1, false, 4, false);
        let (first_slot, _) = index.lookup_or_allocate(key);
        let (slot, lookup) = index.lookup_or_allocate(key);
        assert_eq!(lookup, ShadowLookup::FoundNormal);
        assert_eq!(slot, first_slot);
    }

    #[test]
    fn ring_wraparound_reports_found_modified() {
        let mut index = ShadowSlotIndex::new(4);
        for i in 0..4 {
            let _ = index.lookup_or_allocate(ShadowKey::new(i, false, 4, false));
        }
        let (_, lookup) = index.lookup_or_allocate(ShadowKey::new(9999, false, 4, false));
        assert_eq!(lookup, ShadowLookup::FoundModified);
    }

    #[test]
    fn clear_resets_counters_lookup_path() {
        let mut index = ShadowSlotIndex::new(2);
        let key = ShadowKey::new(1, false, 4, false);
        let _ = index.lookup_or_allocate(key);
        index.clear();
        let (_, lookup) = index.lookup_or_allocate(key);
        assert_eq!(lookup, ShadowLookup::Allocated);
    }

    #[test]
    fn pack_leaf_pte_sets_expected_bits() {
        let pte = pack_leaf_pte(
            0x1234_5000,
            ShadowLeafFlags {
                writable: true,
                user: false,
                no_execute: true,
                pat_bit: false,
                pcd_bit: true,
                pwt_bit: false,
            },
        );
        assert_eq!(pte & 0xFFF, 0b1_0001_0011);
        assert_ne!(pte & (1 << 63), 0);
        assert_eq!(pte & !0xFFF & !(1u64 << 63), 0x1234_5000);
    }

    #[test]
    fn downgrade_scans_every_other_vcpu_in_order() {
        let map1 = RwMap::new();
        let map2 = RwMap::new();
        map1.mark_writable(42);
        map2.mark_writable(42);

        let mut downgraded = vec::Vec::new();
        downgrade_other_vcpus(&[(1, &map1), (2, &map2)], 0, 42, |vcpu, gfn| {
            downgraded.push((vcpu, gfn));
        });
        assert_eq!(downgraded, vec![(1, 42), (2, 42)]);
    }
}
