//! The MMIO hook registry: maps guest-physical ranges to handler callbacks
//! that observe or filter accesses landing in that range.
//!
//! Handles are kept in a list ordered by start address and additionally
//! indexed by a 256 MiB bucket so a lookup only has to scan handles that
//! could plausibly overlap the access. Readers and the two mutating
//! operations (`register`, `unregister`) are serialized through an
//! [`RwLock`](spin::RwLock); taking the writer lock to mutate the list is
//! itself what defers removal until no reader is mid-access.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use spin::RwLock;

/// Number of 256 MiB buckets covering the 4 GiB guest-physical address
/// space, plus one catch-all bucket for everything at or above 4 GiB.
pub const BUCKET_COUNT: usize = 17;
const BUCKET_SHIFT: u32 = 28;
const OVERFLOW_BUCKET: usize = 16;

/// A registered MMIO handler. Returns `true` when it fully handled the
/// access (the caller must not fall through to real memory for those
/// bytes).
pub type MmioHandler = dyn Fn(u64, bool, &mut [u8]) -> bool + Send + Sync;

/// Opaque identifier returned by [`MmioRegistry::register`], used to look a
/// handle back up for [`MmioRegistry::unregister`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MmioHandle(u64);

struct Entry {
    id: u64,
    start: u64,
    len: u64,
    unlocked: bool,
    handler: Arc<MmioHandler>,
}

impl Entry {
    const fn end(&self) -> u64 {
        self.start + self.len
    }

    const fn overlaps(&self, start: u64, len: u64) -> bool {
        self.start < start + len && start < self.end()
    }
}

/// The bucket index a guest-physical address falls into.
#[must_use]
pub const fn bucket_of(gphys: u64) -> usize {
    let bucket = (gphys >> BUCKET_SHIFT) as usize;
    if bucket > OVERFLOW_BUCKET {
        OVERFLOW_BUCKET
    } else {
        bucket
    }
}

/// The inclusive range of buckets `[start, start + len)` can touch.
#[must_use]
pub const fn buckets_for_range(start: u64, len: u64) -> (usize, usize) {
    let last = start.saturating_add(len.saturating_sub(1));
    (bucket_of(start), bucket_of(last))
}

/// The result of slicing a single access against one handle's range: how
/// many bytes fall before the handle starts, how many land inside it (and
/// at what offset into the caller's buffer), and how many fall after.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Split {
    /// Bytes before the handle's range, not serviced by this handle.
    pub before: u64,
    /// Offset into the access buffer where the in-range portion starts.
    pub in_range_offset: u64,
    /// Number of bytes that land inside the handle's range.
    pub in_range_len: u64,
    /// Bytes after the handle's range, not serviced by this handle.
    pub after: u64,
}

/// Slices an access `[gphys, gphys + len)` against a handle occupying
/// `[handle_start, handle_start + handle_len)`. Returns `None` if the access
/// does not overlap the handle at all.
#[must_use]
pub fn split_access(
    gphys: u64,
    len: u64,
    handle_start: u64,
    handle_len: u64,
) -> Option<Split> {
    let access_end = gphys.checked_add(len)?;
    let handle_end = handle_start.checked_add(handle_len)?;
    if handle_start >= access_end || gphys >= handle_end {
        return None;
    }
    let in_start = gphys.max(handle_start);
    let in_end = access_end.min(handle_end);
    Some(Split {
        before: in_start - gphys,
        in_range_offset: in_start - gphys,
        in_range_len: in_end - in_start,
        after: access_end - in_end,
    })
}

/// Thread-safe MMIO hook registry shared by every vCPU of one logical VM.
pub struct MmioRegistry {
    inner: RwLock<Registry>,
}

struct Registry {
    entries: Vec<Entry>,
    buckets: [Vec<u64>; BUCKET_COUNT],
    next_id: u64,
}

impl Default for MmioRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry {
                entries: Vec::new(),
                buckets: core::array::from_fn(|_| Vec::new()),
                next_id: 0,
            }),
        }
    }

    /// Registers a locked handler, invoked while the registry's reader lock
    /// is held. `on_installed` is called with the registered range while
    /// still holding the writer lock, giving the caller (the paging engine)
    /// a chance to invalidate any second-level mappings that overlap it.
    ///
    /// Fails if `[gphys, gphys + len)` overlaps any already-registered
    /// range.
    pub fn register(
        &self,
        gphys: u64,
        len: u64,
        handler: Arc<MmioHandler>,
        on_installed: impl FnOnce(u64, u64),
    ) -> Result<MmioHandle, ()> {
        self.register_inner(gphys, len, handler, false, on_installed)
    }

    /// Like [`Self::register`], but the handler is permitted to re-enter the
    /// registry (for example to register another range) and is invoked
    /// after the reader lock has been released, not while holding it.
    pub fn register_unlocked(
        &self,
        gphys: u64,
        len: u64,
        handler: Arc<MmioHandler>,
        on_installed: impl FnOnce(u64, u64),
    ) -> Result<MmioHandle, ()> {
        self.register_inner(gphys, len, handler, true, on_installed)
    }

    fn register_inner(
        &self,
        gphys: u64,
        len: u64,
        handler: Arc<MmioHandler>,
        unlocked: bool,
        on_installed: impl FnOnce(u64, u64),
    ) -> Result<MmioHandle, ()> {
        let mut reg = self.inner.write();
        if reg.entries.iter().any(|e| e.overlaps(gphys, len)) {
            return Err(());
        }
        let id = reg.next_id;
        reg.next_id += 1;
        let insert_at = reg
            .entries
            .iter()
            .position(|e| e.start > gphys)
            .unwrap_or(reg.entries.len());
        reg.entries.insert(
            insert_at,
            Entry {
                id,
                start: gphys,
                len,
                unlocked,
                handler,
            },
        );
        let (first, last) = buckets_for_range(gphys, len);
        for bucket in &mut reg.buckets[first..=last] {
            bucket.push(id);
        }
        on_installed(gphys, len);
        Ok(MmioHandle(id))
    }

    /// Removes a previously registered handle. Takes the registry's writer
    /// lock, so this blocks until every in-flight [`Self::access_memory`]
    /// call has released its reader lock - that is what makes removal
    /// observably atomic with respect to concurrent accesses.
    pub fn unregister(&self, handle: MmioHandle) {
        let mut reg = self.inner.write();
        if let Some(pos) = reg.entries.iter().position(|e| e.id == handle.0) {
            let entry = reg.entries.remove(pos);
            let (first, last) = buckets_for_range(entry.start, entry.len);
            for bucket in &mut reg.buckets[first..=last] {
                bucket.retain(|&id| id != entry.id);
            }
        }
    }

    /// Dispatches an access against every registered handle overlapping
    /// `[gphys, gphys + buf.len())`, in ascending-gphys order, splitting the
    /// access at handle boundaries. Returns `true` if the entire access was
    /// serviced by registered handlers (nothing left to fall through to
    /// real memory).
    pub fn access_memory(&self, gphys: u64, write: bool, buf: &mut [u8]) -> bool {
        let len = buf.len() as u64;
        if len == 0 {
            return false;
        }
        let (first, last) = buckets_for_range(gphys, len);

        // Collect the overlapping handles (and whether each is unlocked)
        // while holding the reader lock, then decide per-handle whether to
        // keep holding it.
        let mut reg = self.inner.read();
        let mut candidate_ids: Vec<u64> = Vec::new();
        for bucket in &reg.buckets[first..=last] {
            for &id in bucket {
                if !candidate_ids.contains(&id) {
                    candidate_ids.push(id);
                }
            }
        }
        let mut matches: Vec<(u64, u64, bool, Arc<MmioHandler>)> = reg
            .entries
            .iter()
            .filter(|e| candidate_ids.contains(&e.id) && e.overlaps(gphys, len))
            .map(|e| (e.start, e.len, e.unlocked, Arc::clone(&e.handler)))
            .collect();
        matches.sort_by_key(|&(start, ..)| start);

        if matches.is_empty() {
            return false;
        }

        let mut fully_handled = true;
        let mut covered = 0u64;
        for (start, handle_len, unlocked, handler) in matches {
            let Some(split) = split_access(gphys, len, start, handle_len) else {
                continue;
            };
            covered += split.in_range_len;
            let offset = split.in_range_offset as usize;
            let in_len = split.in_range_len as usize;
            let slice = &mut buf[offset..offset + in_len];
            let handled = if unlocked {
                drop(reg);
                let handled = handler(gphys + split.in_range_offset, write, slice);
                reg = self.inner.read();
                handled
            } else {
                handler(gphys + split.in_range_offset, write, slice)
            };
            fully_handled &= handled;
        }
        fully_handled && covered == len
    }

    /// Whether the 4 KiB page containing `gphys` overlaps any registered
    /// handle.
    #[must_use]
    pub fn page_has_hook(&self, gphys: u64) -> bool {
        const PAGE_SIZE: u64 = 0x1000;
        let page_start = gphys & !(PAGE_SIZE - 1);
        let reg = self.inner.read();
        let bucket = bucket_of(page_start);
        reg.buckets[bucket]
            .iter()
            .filter_map(|id| reg.entries.iter().find(|e| e.id == *id))
            .any(|e| e.overlaps(page_start, PAGE_SIZE))
    }

    /// Whether `[start, start + len)` overlaps any registered handle, used
    /// by the second-level fault handlers to reject a large-page fill that
    /// would otherwise paper over an MMIO hook.
    #[must_use]
    pub fn buckets_overlap(&self, start: u64, len: u64) -> bool {
        let reg = self.inner.read();
        let (first, last) = buckets_for_range(start, len);
        (first..=last)
            .flat_map(|bucket| reg.buckets[bucket].iter())
            .filter_map(|id| reg.entries.iter().find(|e| e.id == *id))
            .any(|e| e.overlaps(start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::{bucket_of, buckets_for_range, split_access, MmioRegistry, OVERFLOW_BUCKET};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn bucket_of_splits_on_top_nibble() {
        assert_eq!(bucket_of(0x0000_0000), 0);
        assert_eq!(bucket_of(0x1000_0000), 1);
        assert_eq!(bucket_of(0xFEE0_0000), 0xF);
        assert_eq!(bucket_of(0x1_0000_0000), OVERFLOW_BUCKET);
    }

    #[test]
    fn buckets_for_range_spans_multiple_buckets() {
        let (first, last) = buckets_for_range(0x0FFF_FF00, 0x200);
        assert_eq!(first, 0);
        assert_eq!(last, 1);
    }

    #[test]
    fn split_access_outside_range_is_none() {
        assert!(split_access(0x1000, 0x10, 0x2000, 0x10).is_none());
    }

    #[test]
    fn split_access_fully_inside() {
        let split = split_access(0x1000, 0x100, 0x1010, 0x10).unwrap();
        assert_eq!(split.before, 0x10);
        assert_eq!(split.in_range_len, 0x10);
        assert_eq!(split.after, 0xe0);
    }

    #[test]
    fn split_access_straddles_two_handles() {
        // Access covers [0xFEE00300, 0xFEE00314), handle A at +0x300..+0x304,
        // handle B at +0x310..+0x314 - mirrors the straddling-SSE-store case.
        let base = 0xFEE0_0000u64;
        let a = split_access(base + 0x2FC, 0x18, base + 0x300, 4).unwrap();
        assert_eq!(a.in_range_len, 4);
        let b = split_access(base + 0x2FC, 0x18, base + 0x310, 4).unwrap();
        assert_eq!(b.in_range_len, 4);
    }

    #[test]
    fn register_rejects_overlap() {
        let reg = MmioRegistry::new();
        let handle = Arc::new(|_: u64, _: bool, _: &mut [u8]| true);
        reg.register(0x1000, 0x10, handle.clone(), |_, _| {}).unwrap();
        assert!(reg.register(0x1008, 0x10, handle, |_, _| {}).is_err());
    }

    #[test]
    fn access_memory_dispatches_and_reports_full_coverage() {
        let reg = MmioRegistry::new();
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = Arc::clone(&seen);
        let handler: Arc<super::MmioHandler> = Arc::new(move |_, _, buf| {
            seen_clone.store(true, Ordering::SeqCst);
            buf.fill(0xAA);
            true
        });
        reg.register(0x2000, 0x10, handler, |_, _| {}).unwrap();

        let mut buf = [0u8; 0x10];
        let handled = reg.access_memory(0x2000, false, &mut buf);
        assert!(handled);
        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(buf, [0xAA; 0x10]);
    }

    #[test]
    fn access_memory_outside_any_handle_is_not_handled() {
        let reg = MmioRegistry::new();
        let mut buf = [0u8; 4];
        assert!(!reg.access_memory(0x5000, false, &mut buf));
    }

    #[test]
    fn unregister_removes_handle_from_future_accesses() {
        let reg = MmioRegistry::new();
        let handler: Arc<super::MmioHandler> = Arc::new(|_, _, _| true);
        let handle = reg.register(0x3000, 0x10, handler, |_, _| {}).unwrap();
        reg.unregister(handle);
        let mut buf = [0u8; 0x10];
        assert!(!reg.access_memory(0x3000, false, &mut buf));
    }

    #[test]
    fn page_has_hook_checks_the_containing_4k_page() {
        let reg = MmioRegistry::new();
        let handler: Arc<super::MmioHandler> = Arc::new(|_, _, _| true);
        reg.register(0x4008, 4, handler, |_, _| {}).unwrap();
        assert!(reg.page_has_hook(0x4fff));
        assert!(!reg.page_has_hook(0x5fff));
    }
}
