//! Page-walk cursor arithmetic shared by the nested-paging and shadow-paging
//! fault handlers: picking the largest page size a fault can legally be
//! satisfied with, and computing the shadow-page lookup key used by the
//! SPT_2 ring buffers.
//!
//! The actual table walking (reading/writing real page-table entries,
//! talking to the guest-to-host mapper) lives in the `hypervisor` binary
//! crate, since it needs real memory access; this module only holds the
//! size-selection and key-derivation logic, which is pure.

/// A candidate page size for a second-level (nested or shadow) mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum PageSize {
    /// 4 KiB.
    Size4K,
    /// 2 MiB.
    Size2M,
    /// 1 GiB.
    Size1G,
}

impl PageSize {
    /// Size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }

    /// The address mask that clears everything below this page size's
    /// alignment boundary.
    #[must_use]
    pub const fn align_mask(self) -> u64 {
        !(self.bytes() - 1)
    }

    /// All candidate sizes, largest first - the order [`choose_page_size`]
    /// evaluates them in.
    pub const ALL_LARGEST_FIRST: [Self; 3] = [Self::Size1G, Self::Size2M, Self::Size4K];
}

/// Picks the largest page size usable to map the fault at `gphys`, subject
/// to the constraints the fault handler must honor: the cursor must
/// already be positioned at or above that level in the walked table chain,
/// the host must support the size, the page-aligned range must not overlap
/// any MMIO hook, the guest-to-host mapper must yield a host-physical
/// region of that size for the whole range, and the cache-attribute
/// context must report one uniform type across the range.
///
/// Each predicate is supplied by the caller so this function stays free of
/// any dependency on real memory, MMIO state or MSRs; it only encodes the
/// precedence in which the constraints are applied.
pub fn choose_page_size(
    gphys: u64,
    cursor_level_allows: impl Fn(PageSize) -> bool,
    host_supports: impl Fn(PageSize) -> bool,
    overlaps_mmio: impl Fn(u64, u64) -> bool,
    host_region_is_contiguous: impl Fn(u64, u64) -> bool,
    cache_type_is_uniform: impl Fn(u64, u64) -> bool,
) -> PageSize {
    for size in PageSize::ALL_LARGEST_FIRST {
        if !cursor_level_allows(size) || !host_supports(size) {
            continue;
        }
        let aligned = gphys & size.align_mask();
        let len = size.bytes();
        if overlaps_mmio(aligned, len) {
            continue;
        }
        if !host_region_is_contiguous(aligned, len) {
            continue;
        }
        if !cache_type_is_uniform(aligned, len) {
            continue;
        }
        return size;
    }
    PageSize::Size4K
}

/// The number of levels a guest page-table walk traversed before reaching a
/// leaf, used as half of the SPT_2 shadow-page key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShadowKey(u64);

impl ShadowKey {
    /// Builds the SPT_2 shadow-page key `(gfn << 12) | tag`, where `tag`
    /// packs the page's role: whether it is a shadow1 (page-table) or
    /// shadow2 (page-directory) page, the number of guest paging levels in
    /// effect, and whether it backs a large page.
    #[must_use]
    pub const fn new(gfn: u64, is_shadow2: bool, guest_levels: u8, is_large_page: bool) -> Self {
        let shadow_bit: u64 = if is_shadow2 { 1 << 1 } else { 0 };
        let large_bit: u64 = if is_large_page { 1 } else { 0 };
        let levels: u64 = (guest_levels as u64 & 0b111) << 2;
        Self((gfn << 12) | shadow_bit | levels | large_bit)
    }

    /// The raw packed key value, used as the ring-buffer lookup tag.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{choose_page_size, PageSize, ShadowKey};

    #[test]
    fn chooses_largest_size_when_everything_allows_it() {
        let size = choose_page_size(
            0x1_4000_0000,
            |_| true,
            |_| true,
            |_, _| false,
            |_, _| true,
            |_, _| true,
        );
        assert_eq!(size, PageSize::Size1G);
    }

    #[test]
    fn falls_back_past_mmio_overlap() {
        let size = choose_page_size(
            0x1000,
            |_| true,
            |_| true,
            |start, len| start < 0x2000 && len >= PageSize::Size1G.bytes(),
            |_, _| true,
            |_, _| true,
        );
        assert_ne!(size, PageSize::Size1G);
    }

    #[test]
    fn falls_all_the_way_back_to_4k_when_nothing_else_fits() {
        let size = choose_page_size(
            0x1000,
            |s| s == PageSize::Size4K,
            |_| true,
            |_, _| false,
            |_, _| true,
            |_, _| true,
        );
        assert_eq!(size, PageSize::Size4K);
    }

    #[test]
    fn non_uniform_cache_type_rejects_a_size() {
        let size = choose_page_size(
            0x20_0000,
            |_| true,
            |_| true,
            |_, _| false,
            |_, _| true,
            |_, len| len < PageSize::Size2M.bytes(),
        );
        assert_eq!(size, PageSize::Size4K);
    }

    #[test]
    fn shadow_key_packs_fields_distinctly() {
        let a = ShadowKey::new(0x123, false, 4, false);
        let b = ShadowKey::new(0x123, true, 4, false);
        let c = ShadowKey::new(0x123, false, 4, true);
        assert_ne!(a.raw(), b.raw());
        assert_ne!(a.raw(), c.raw());
        assert_eq!(a.raw() & !0b111, 0x123 << 12);
    }
}
